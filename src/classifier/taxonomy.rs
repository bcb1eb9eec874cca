// src/classifier/taxonomy.rs
// Closed two-level category taxonomy

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Top-level category group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
pub enum CategoryGroup {
    #[strum(serialize = "API_ERROR")]
    ApiError,
    #[strum(serialize = "DATA_ERROR")]
    DataError,
    #[strum(serialize = "DEPENDENCY_ERROR")]
    DependencyError,
    #[strum(serialize = "LOGIC_ERROR")]
    LogicError,
    #[strum(serialize = "CONFIG_ERROR")]
    ConfigError,
    #[strum(serialize = "PERFORMANCE")]
    Performance,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Leaf category, serialized as `GROUP.leaf`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
pub enum Category {
    #[strum(serialize = "API_ERROR.rate_limited")]
    ApiRateLimited,
    #[strum(serialize = "API_ERROR.bad_request")]
    ApiBadRequest,
    #[strum(serialize = "API_ERROR.auth_failed")]
    ApiAuthFailed,

    #[strum(serialize = "DATA_ERROR.invalid_format")]
    DataInvalidFormat,
    #[strum(serialize = "DATA_ERROR.missing_data")]
    DataMissing,
    #[strum(serialize = "DATA_ERROR.inconsistent_state")]
    DataInconsistentState,

    #[strum(serialize = "DEPENDENCY_ERROR.timeout")]
    DependencyTimeout,
    #[strum(serialize = "DEPENDENCY_ERROR.connection_failed")]
    DependencyConnectionFailed,
    #[strum(serialize = "DEPENDENCY_ERROR.upstream_error")]
    DependencyUpstreamError,

    #[strum(serialize = "LOGIC_ERROR.null_reference")]
    LogicNullReference,
    #[strum(serialize = "LOGIC_ERROR.unhandled_case")]
    LogicUnhandledCase,
    #[strum(serialize = "LOGIC_ERROR.race_condition")]
    LogicRaceCondition,

    #[strum(serialize = "CONFIG_ERROR.missing_config")]
    ConfigMissing,
    #[strum(serialize = "CONFIG_ERROR.invalid_value")]
    ConfigInvalidValue,

    #[strum(serialize = "PERFORMANCE.slow_query")]
    PerfSlowQuery,
    #[strum(serialize = "PERFORMANCE.memory_exhaustion")]
    PerfMemoryExhaustion,
    #[strum(serialize = "PERFORMANCE.resource_contention")]
    PerfResourceContention,

    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl Category {
    pub fn group(self) -> CategoryGroup {
        use Category::*;
        match self {
            ApiRateLimited | ApiBadRequest | ApiAuthFailed => CategoryGroup::ApiError,
            DataInvalidFormat | DataMissing | DataInconsistentState => CategoryGroup::DataError,
            DependencyTimeout | DependencyConnectionFailed | DependencyUpstreamError => {
                CategoryGroup::DependencyError
            }
            LogicNullReference | LogicUnhandledCase | LogicRaceCondition => CategoryGroup::LogicError,
            ConfigMissing | ConfigInvalidValue => CategoryGroup::ConfigError,
            PerfSlowQuery | PerfMemoryExhaustion | PerfResourceContention => CategoryGroup::Performance,
            Unknown => CategoryGroup::Unknown,
        }
    }

    /// One-line meaning, used when prompting for a category
    pub fn description(self) -> &'static str {
        use Category::*;
        match self {
            ApiRateLimited => "caller exceeded a rate limit or quota (HTTP 429)",
            ApiBadRequest => "request rejected as malformed or semantically invalid (HTTP 400)",
            ApiAuthFailed => "authentication or authorization failure (HTTP 401/403)",
            DataInvalidFormat => "payload could not be parsed or decoded",
            DataMissing => "required record or field absent",
            DataInconsistentState => "stored data contradicts itself or the expected invariants",
            DependencyTimeout => "downstream service or database did not answer in time",
            DependencyConnectionFailed => "connection to a dependency refused or reset",
            DependencyUpstreamError => "dependency answered with an error (5xx, bad gateway)",
            LogicNullReference => "null/None dereference in application code",
            LogicUnhandledCase => "code path reached an input it does not handle",
            LogicRaceCondition => "ordering or concurrency bug between requests or tasks",
            ConfigMissing => "required setting, secret, or environment variable not provided",
            ConfigInvalidValue => "setting present but holds an invalid value",
            PerfSlowQuery => "query or call far slower than normal",
            PerfMemoryExhaustion => "out of memory or memory leak",
            PerfResourceContention => "deadlock, lock wait, or pool exhaustion",
            Unknown => "none of the above",
        }
    }

    /// Every leaf except `UNKNOWN`
    pub fn leaves() -> impl Iterator<Item = Category> {
        Category::iter().filter(|c| *c != Category::Unknown)
    }

    /// Parse a label that may differ in case or surrounding whitespace.
    pub fn parse_lenient(label: &str) -> Option<Category> {
        let label = label.trim().trim_matches('"');
        if let Ok(category) = Category::from_str(label) {
            return Some(category);
        }
        Category::iter().find(|c| c.as_ref().eq_ignore_ascii_case(label))
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Category::parse_lenient(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown category '{}'", label)))
    }
}

/// Render the taxonomy as an indented list for prompts
pub fn render_taxonomy() -> String {
    let mut out = String::new();
    for group in CategoryGroup::iter().filter(|g| *g != CategoryGroup::Unknown) {
        out.push_str(group.as_ref());
        out.push('\n');
        for leaf in Category::leaves().filter(|c| c.group() == group) {
            out.push_str(&format!("  - {}: {}\n", leaf, leaf.description()));
        }
    }
    out.push_str(&format!("{}: {}\n", Category::Unknown, Category::Unknown.description()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_six_groups_with_two_or_three_leaves() {
        let groups: Vec<_> = CategoryGroup::iter()
            .filter(|g| *g != CategoryGroup::Unknown)
            .collect();
        assert_eq!(groups.len(), 6);
        for group in groups {
            let leaves = Category::leaves().filter(|c| c.group() == group).count();
            assert!((2..=3).contains(&leaves), "{} has {} leaves", group, leaves);
        }
    }

    #[test]
    fn test_leaf_label_prefix_matches_group() {
        for leaf in Category::leaves() {
            let label = leaf.to_string();
            assert!(
                label.starts_with(&format!("{}.", leaf.group())),
                "{} not under {}",
                label,
                leaf.group()
            );
        }
    }

    #[test]
    fn test_serde_uses_dotted_labels() {
        let json = serde_json::to_string(&Category::ApiRateLimited).unwrap();
        assert_eq!(json, r#""API_ERROR.rate_limited""#);
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::ApiRateLimited);
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(
            Category::parse_lenient(" logic_error.NULL_REFERENCE "),
            Some(Category::LogicNullReference)
        );
        assert_eq!(Category::parse_lenient("unknown"), Some(Category::Unknown));
        assert_eq!(Category::parse_lenient("API_ERROR"), None);
        assert_eq!(Category::parse_lenient("FOO.bar"), None);
    }

    #[test]
    fn test_render_taxonomy_lists_every_leaf() {
        let rendered = render_taxonomy();
        for leaf in Category::leaves() {
            assert!(rendered.contains(leaf.as_ref()));
        }
        assert!(rendered.contains("UNKNOWN"));
    }
}
