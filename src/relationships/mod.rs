pub mod analyzer;

pub use analyzer::{
    build_where_multi_field, in_clause, RelationshipAnalyzer, RelationshipNode, RelationshipTree,
    MAX_IN_CLAUSE_IDS, PRIORITY_OBJECTS,
};
