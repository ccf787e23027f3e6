//! Rule registration and ordering.

use std::collections::HashSet;
use std::fmt;

use crate::rules::Rule;

use super::EngineError;

/// The frozen, ordered rule set for one run.
///
/// Built once before analysis from a static table; duplicate ids are a
/// configuration error, and rules are reported in numeric id order so
/// output stays stable regardless of registration order.
pub struct RuleRegistry {
    rules: Vec<Box<dyn Rule>>,
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.rules.iter().map(|r| r.id()).collect::<Vec<_>>())
            .finish()
    }
}

impl RuleRegistry {
    pub fn from_rules(
        rules: impl IntoIterator<Item = Box<dyn Rule>>,
    ) -> Result<RuleRegistry, EngineError> {
        let mut rules: Vec<Box<dyn Rule>> = rules.into_iter().collect();

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate rule id {} ({})",
                    rule.id(),
                    rule.name()
                )));
            }
        }

        rules.sort_by_key(|rule| (numeric_id(rule.id()), rule.id()));
        Ok(RuleRegistry { rules })
    }

    /// Registry holding every built-in rule.
    pub fn built_in() -> Result<RuleRegistry, EngineError> {
        Self::from_rules(crate::rules::built_in_rules())
    }

    pub fn rules(&self) -> &[Box<dyn Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Numeric component of a `BA<digits>` id; ids without digits sort last.
fn numeric_id(id: &str) -> u64 {
    let digits: String = id.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::results::RuleResult;
    use crate::rules::{AnalysisContext, Applicability};

    struct FakeRule {
        id: &'static str,
    }

    impl Rule for FakeRule {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Fake"
        }

        fn description(&self) -> &'static str {
            "test double"
        }

        fn can_analyze(&self, _ctx: &AnalysisContext) -> Applicability {
            Applicability::Applicable
        }

        fn analyze(&self, _ctx: &AnalysisContext) -> Vec<RuleResult> {
            vec![RuleResult::pass("ok")]
        }
    }

    fn rule(id: &'static str) -> Box<dyn Rule> {
        Box::new(FakeRule { id })
    }

    #[test]
    fn sorts_by_numeric_id() {
        let registry =
            RuleRegistry::from_rules([rule("BA3001"), rule("BA2021"), rule("BA2006")]).unwrap();
        let ids: Vec<_> = registry.rules().iter().map(|r| r.id()).collect();
        assert_eq!(ids, ["BA2006", "BA2021", "BA3001"]);
    }

    #[test]
    fn duplicate_ids_are_a_configuration_error() {
        let err = RuleRegistry::from_rules([rule("BA2001"), rule("BA2001")]).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("BA2001"));
    }

    #[test]
    fn built_in_registry_loads_and_is_ordered() {
        let registry = RuleRegistry::built_in().unwrap();
        assert!(!registry.is_empty());

        let ids: Vec<_> = registry.rules().iter().map(|r| r.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_by_key(|id| numeric_id(id));
        assert_eq!(ids, sorted);
    }
}
