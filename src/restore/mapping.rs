use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Run-scoped map from source-tenant record ids to target-tenant ids,
/// populated as parents load and consumed while resolving child lookups.
///
/// Append-only: re-inserting the same `(object, old id)` with the same new
/// id is a no-op; a different new id is a conflict and fatal.
pub struct IdMapping {
    inner: RwLock<HashMap<(String, String), String>>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, object: &str, old_id: &str, new_id: &str) -> Result<()> {
        let mut map = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = (object.to_string(), old_id.to_string());
        if let Some(existing) = map.get(&key) {
            if existing != new_id {
                bail!(
                    "Conflicting id mapping for {} {}: {} vs {}",
                    object,
                    old_id,
                    existing,
                    new_id
                );
            }
            return Ok(());
        }
        map.insert(key, new_id.to_string());
        Ok(())
    }

    pub fn resolve(&self, object: &str, old_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(object.to_string(), old_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdMapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let mapping = IdMapping::new();
        mapping.insert("Account", "001A", "001N").unwrap();

        assert_eq!(mapping.resolve("Account", "001A").as_deref(), Some("001N"));
        assert_eq!(mapping.resolve("Account", "001B"), None);
        assert_eq!(mapping.resolve("Contact", "001A"), None, "keys are per object");
    }

    #[test]
    fn test_idempotent_reinsert() {
        let mapping = IdMapping::new();
        mapping.insert("Account", "001A", "001N").unwrap();
        mapping.insert("Account", "001A", "001N").unwrap();
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_conflicting_reinsert_is_fatal() {
        let mapping = IdMapping::new();
        mapping.insert("Account", "001A", "001N").unwrap();

        let err = mapping
            .insert("Account", "001A", "001X")
            .expect_err("conflicting new id must fail");
        let message = err.to_string();
        assert!(message.contains("001A"), "error names the old id: {}", message);
        assert!(message.contains("001N") && message.contains("001X"));

        // The original mapping survives.
        assert_eq!(mapping.resolve("Account", "001A").as_deref(), Some("001N"));
    }

    #[test]
    fn test_concurrent_inserts_are_safe() {
        use std::sync::Arc;

        let mapping = Arc::new(IdMapping::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mapping = mapping.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    mapping
                        .insert("Account", &format!("001{:03}", i), &format!("001N{:03}", i))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mapping.len(), 100, "idempotent inserts collapse");
    }
}
