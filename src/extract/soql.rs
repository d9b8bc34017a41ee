/// Strip a leading `WHERE ` keyword a user may have typed into a custom
/// predicate.
pub fn strip_where_prefix(fragment: &str) -> &str {
    let trimmed = fragment.trim();
    match trimmed.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("where ") => trimmed[6..].trim_start(),
        _ => trimmed,
    }
}

/// Combine two predicate fragments as `(<left>) AND (<right>)`.
///
/// Either side may be absent; both sides are parenthesized so caller
/// fragments never change precedence.
pub fn merge_where(left: Option<&str>, right: Option<&str>) -> Option<String> {
    let left = left.map(strip_where_prefix).filter(|s| !s.is_empty());
    let right = right.map(strip_where_prefix).filter(|s| !s.is_empty());

    match (left, right) {
        (Some(l), Some(r)) => Some(format!("({}) AND ({})", l, r)),
        (Some(l), None) => Some(l.to_string()),
        (None, Some(r)) => Some(r.to_string()),
        (None, None) => None,
    }
}

/// Assemble the full query text for one object extract.
pub fn build_query(
    object: &str,
    fields: &[String],
    where_clause: Option<&str>,
    limit: u64,
) -> String {
    let mut soql = format!("SELECT {} FROM {}", fields.join(", "), object);

    if let Some(predicate) = where_clause.map(strip_where_prefix).filter(|s| !s.is_empty()) {
        soql.push_str(" WHERE ");
        soql.push_str(predicate);
    }

    if limit > 0 {
        soql.push_str(&format!(" LIMIT {}", limit));
    }

    soql
}

/// COUNT-shaped query used for preview displays only.
pub fn build_count_query(object: &str, where_clause: Option<&str>) -> String {
    let mut soql = format!("SELECT COUNT() FROM {}", object);
    if let Some(predicate) = where_clause.map(strip_where_prefix).filter(|s| !s.is_empty()) {
        soql.push_str(" WHERE ");
        soql.push_str(predicate);
    }
    soql
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_build_query_plain() {
        let soql = build_query("Account", &fields(&["Id", "Name"]), None, 0);
        assert_eq!(soql, "SELECT Id, Name FROM Account");
    }

    #[test]
    fn test_build_query_with_where_and_limit() {
        let soql = build_query(
            "Account",
            &fields(&["Id"]),
            Some("Name != null"),
            25,
        );
        assert_eq!(soql, "SELECT Id FROM Account WHERE Name != null LIMIT 25");
    }

    #[test]
    fn test_user_typed_where_keyword_is_stripped() {
        let soql = build_query("Account", &fields(&["Id"]), Some("WHERE Name != null"), 0);
        assert_eq!(soql, "SELECT Id FROM Account WHERE Name != null");

        // Case-insensitive.
        assert_eq!(strip_where_prefix("where X = 1"), "X = 1");
        assert_eq!(strip_where_prefix("  WHERE  X = 1"), "X = 1");
        // A column merely starting with "where" is untouched.
        assert_eq!(strip_where_prefix("whereabouts = 'x'"), "whereabouts = 'x'");
    }

    #[test]
    fn test_merge_where_parenthesizes_both_sides() {
        let merged = merge_where(
            Some("LastModifiedDate > 2024-01-01T00:00:00Z"),
            Some("Industry = 'Tech' OR Industry = 'Media'"),
        );
        assert_eq!(
            merged.as_deref(),
            Some(
                "(LastModifiedDate > 2024-01-01T00:00:00Z) AND (Industry = 'Tech' OR Industry = 'Media')"
            )
        );
    }

    #[test]
    fn test_merge_where_single_sides() {
        assert_eq!(merge_where(Some("A = 1"), None).as_deref(), Some("A = 1"));
        assert_eq!(merge_where(None, Some("B = 2")).as_deref(), Some("B = 2"));
        assert_eq!(merge_where(None, None), None);
        assert_eq!(merge_where(Some("  "), Some("WHERE ")), None);
    }

    #[test]
    fn test_count_query_shape() {
        assert_eq!(
            build_count_query("Contact", Some("AccountId != null")),
            "SELECT COUNT() FROM Contact WHERE AccountId != null"
        );
        assert_eq!(build_count_query("Contact", None), "SELECT COUNT() FROM Contact");
    }
}
