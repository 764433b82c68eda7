//! Alias and parameter naming.
//!
//! All identifiers used in compiled statements come from here, so names
//! stay collision-free: relation aliases encode both the base alias and the
//! relation name, and parameter names carry a per-compile counter.

use crate::metadata::{EntityMetadata, RelationMeta};

/// The entity's own query alias.
pub fn alias_for(meta: &EntityMetadata) -> String {
    meta.query_alias.clone()
}

/// Alias for a relation reached from `base`.
///
/// Encodes the target type and the relation name, so reaching the same
/// target through two different relations (or the same relation name from
/// two different bases) never collides.
pub fn alias_for_relation(base: &str, relation: &RelationMeta) -> String {
    format!("{}__{}_{}", base, relation.target, relation.name)
}

/// Alias for a many-to-many join table reached from `base`.
pub fn join_table_alias(base: &str, relation: &RelationMeta) -> String {
    format!("{}__jt_{}", base, relation.name)
}

/// Bound-parameter name allocator, scoped to one compiled statement.
///
/// The counter wraps after 1000 to keep identifiers short; safe because
/// names are never persisted or compared across statements.
#[derive(Debug, Default)]
pub struct ParamNamer {
    counter: u16,
}

impl ParamNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next parameter name for a field path.
    pub fn name(&mut self, field_path: &str) -> String {
        self.counter = if self.counter >= 1000 {
            1
        } else {
            self.counter + 1
        };
        format!("params_{}_{}", field_path.replace('.', "_"), self.counter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::{Cardinality, RelationLink};

    fn relation(name: &str, target: &str) -> RelationMeta {
        RelationMeta {
            name: name.to_string(),
            cardinality: Cardinality::Many,
            nullable: true,
            target: target.to_string(),
            link: RelationLink::ForeignColumn {
                column: "owner_id".to_string(),
            },
        }
    }

    #[test]
    fn relation_aliases_distinguish_paths() {
        let manager = relation("manager", "Users");
        let reports = relation("reports", "Users");

        // Same target, different relation names.
        assert_ne!(
            alias_for_relation("users", &manager),
            alias_for_relation("users", &reports)
        );
        // Same relation name, different bases.
        assert_ne!(
            alias_for_relation("users", &manager),
            alias_for_relation("audits", &manager)
        );
        assert_eq!(
            alias_for_relation("users", &manager),
            "users__Users_manager"
        );
    }

    #[test]
    fn parameter_names_are_distinct_within_one_compile() {
        let mut namer = ParamNamer::new();
        let a = namer.name("login");
        let b = namer.name("login");
        assert_ne!(a, b);
        assert_eq!(a, "params_login_1");
        assert_eq!(b, "params_login_2");
    }

    #[test]
    fn counter_wraps_after_bound() {
        let mut namer = ParamNamer::new();
        let mut last = String::new();
        for _ in 0..1001 {
            last = namer.name("f");
        }
        assert_eq!(last, "params_f_1");
    }

    #[test]
    fn dots_in_field_paths_become_underscores() {
        let mut namer = ParamNamer::new();
        assert_eq!(namer.name("roles.key"), "params_roles_key_1");
    }
}
