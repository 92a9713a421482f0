//! Configured targets
//!
//! The unit of analysis memoization: a target name together with the
//! configuration it is analysed under. Two configured targets coincide
//! iff their names are equal and their configurations hash-equal.

use girder_expr::{Configuration, EntityName};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfiguredTarget {
    pub target: EntityName,
    pub config: Configuration,
}

pub type ConfiguredTargetPtr = Arc<ConfiguredTarget>;

impl ConfiguredTarget {
    pub fn new(target: EntityName, config: Configuration) -> Self {
        Self { target, config }
    }

    /// Rendering for diagnostics, with the configuration truncated to
    /// the given width.
    pub fn to_short_string(&self, limit: usize) -> String {
        format!(
            "{} ({})",
            self.target,
            self.config.expr().to_abbrev_string(limit)
        )
    }
}

impl fmt::Display for ConfiguredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.target, self.config.expr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_expr::ReferenceKind;
    use serde_json::json;

    #[test]
    fn test_equality_by_name_and_config_hash() {
        let name = EntityName::named("r", "m", "t", ReferenceKind::Target);
        let a = ConfiguredTarget::new(
            name.clone(),
            Configuration::from_json(&json!({"OS": "linux"})),
        );
        let b = ConfiguredTarget::new(
            name.clone(),
            Configuration::from_json(&json!({"OS": "linux"})),
        );
        let c = ConfiguredTarget::new(name, Configuration::from_json(&json!({"OS": "darwin"})));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
