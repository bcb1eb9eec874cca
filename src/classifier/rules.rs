// src/classifier/rules.rs
// Ordered rule table for deterministic classification

use super::taxonomy::Category;
use crate::preprocess::PreparedReport;
use regex::Regex;
use std::sync::LazyLock;

/// Which part of the report a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Message, error code, exception type and correlated logs
    Haystack,
    /// Exception type, message and stack trace
    Stack,
}

#[derive(Debug)]
pub struct Rule {
    pub id: &'static str,
    pub category: Category,
    pub scope: Scope,
    pattern: Regex,
}

impl Rule {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn matches(&self, input: &RuleInput) -> bool {
        match self.scope {
            Scope::Haystack => self.pattern.is_match(&input.haystack),
            Scope::Stack => self.pattern.is_match(&input.stack),
        }
    }
}

/// Owned text a rule pass runs over, so it can move to a blocking thread
#[derive(Debug, Clone, Default)]
pub struct RuleInput {
    pub haystack: String,
    pub stack: String,
}

impl RuleInput {
    pub fn from_report(report: &PreparedReport) -> Self {
        let info = &report.report.error_info;
        let stack = [
            report.stack.exception_type.as_deref().unwrap_or_default(),
            info.error_message.as_str(),
            report.report.stack_trace().unwrap_or_default(),
        ]
        .join("\n");
        Self {
            haystack: report.haystack(),
            stack,
        }
    }
}

#[allow(clippy::expect_used)]
fn rule(id: &'static str, category: Category, scope: Scope, pattern: &str) -> Rule {
    Rule {
        id,
        category,
        scope,
        pattern: Regex::new(pattern).expect("valid rule regex"),
    }
}

/// Evaluated top to bottom; the first match wins.
pub static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use Category::*;
    use Scope::*;
    vec![
        rule(
            "rate_limit",
            ApiRateLimited,
            Haystack,
            r"(?i)rate[ _-]?limit|too many requests|\b429\b|quota exceeded|throttl",
        ),
        rule(
            "auth_failed",
            ApiAuthFailed,
            Haystack,
            r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|authentication failed|invalid (api[ _-]?key|token)|token expired|access denied",
        ),
        rule(
            "resource_contention",
            PerfResourceContention,
            Haystack,
            r"(?i)deadlock|lock wait|pool (is )?exhausted|too many connections|could not obtain lock",
        ),
        rule(
            "timeout",
            DependencyTimeout,
            Haystack,
            r"(?i)timed?[ _-]?out|deadline exceeded|ETIMEDOUT",
        ),
        rule(
            "connection_failed",
            DependencyConnectionFailed,
            Haystack,
            r"(?i)connection (refused|reset|closed|aborted)|ECONNREFUSED|ECONNRESET|could not connect|no route to host|broken pipe",
        ),
        rule(
            "upstream_error",
            DependencyUpstreamError,
            Haystack,
            r"(?i)\b50[234]\b|bad gateway|service unavailable|upstream (error|returned)",
        ),
        rule(
            "null_reference",
            LogicNullReference,
            Stack,
            r"(?i)NullPointerException|'NoneType' object|null reference|nil pointer|cannot read propert(y|ies) of (null|undefined)|undefined is not an object",
        ),
        rule(
            "out_of_memory",
            PerfMemoryExhaustion,
            Haystack,
            r"(?i)out ?of ?memory|OutOfMemoryError|\bMemoryError\b|OOMKilled|heap space",
        ),
        rule(
            "missing_config",
            ConfigMissing,
            Haystack,
            r"(?i)(missing|not set|undefined|required)\W+(\w+\W+){0,4}(config\w*|setting|env(ironment)? var\w*|secret)|ConfigurationError|KeyError: '[A-Z][A-Z0-9_]+'",
        ),
        rule(
            "invalid_format",
            DataInvalidFormat,
            Haystack,
            r"(?i)JSONDecodeError|UnicodeDecodeError|malformed|invalid (json|format)|unexpected token|failed to (parse|deserializ)",
        ),
        rule(
            "bad_request",
            ApiBadRequest,
            Haystack,
            r"(?i)\b400\b|bad request|validation (error|failed)",
        ),
        rule(
            "race_condition",
            LogicRaceCondition,
            Haystack,
            r"(?i)race condition|data race|ConcurrentModificationException|concurrent modification",
        ),
        rule(
            "slow_query",
            PerfSlowQuery,
            Haystack,
            r"(?i)slow query|query took \d+",
        ),
    ]
});

/// First matching rule, if any
pub fn match_rules(input: &RuleInput) -> Option<&'static Rule> {
    RULES.iter().find(|r| r.matches(input))
}
