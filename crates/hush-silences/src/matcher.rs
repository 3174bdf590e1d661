//! Label matchers and their compiled form.
//!
//! A [`Matcher`] is the wire/storage representation of a single label
//! predicate. Before a silence is accepted every matcher is compiled into a
//! [`CompiledMatcher`]; regular expressions are built exactly once at that
//! point and reused for every evaluation afterwards.
//!
//! Evaluation is pure: [`matches_all`] touches no shared state and can be
//! called from any number of threads at once.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SilenceError};

/// A set of alert labels.
pub type LabelSet = HashMap<String, String>;

/// Compiled regex programs larger than this are rejected.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Comparison operator of a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOperator {
    /// The label value equals the matcher value.
    #[serde(rename = "=")]
    Equal,
    /// The label value differs from the matcher value.
    #[serde(rename = "!=")]
    NotEqual,
    /// The label value matches the (anchored) regular expression.
    #[serde(rename = "=~")]
    RegexMatch,
    /// The label value does not match the (anchored) regular expression.
    #[serde(rename = "!~")]
    RegexNotMatch,
}

impl MatchOperator {
    /// Returns the operator as its Alertmanager symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::RegexMatch => "=~",
            Self::RegexNotMatch => "!~",
        }
    }

    /// Returns true for the two regex operators.
    #[must_use]
    pub const fn is_regex(&self) -> bool {
        matches!(self, Self::RegexMatch | Self::RegexNotMatch)
    }

    /// Returns true for the two negated operators.
    #[must_use]
    pub const fn is_negated(&self) -> bool {
        matches!(self, Self::NotEqual | Self::RegexNotMatch)
    }
}

impl fmt::Display for MatchOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A single label predicate as submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Matcher {
    /// The label key.
    pub name: String,
    /// How the label value is compared.
    pub operator: MatchOperator,
    /// The literal value or regular expression.
    pub value: String,
}

impl Matcher {
    /// Maximum length of a matcher name, in characters.
    pub const MAX_NAME_LENGTH: usize = 255;
    /// Maximum length of a matcher value, in characters.
    pub const MAX_VALUE_LENGTH: usize = 1024;

    /// Creates a matcher without validating it.
    pub fn new(name: impl Into<String>, operator: MatchOperator, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator,
            value: value.into(),
        }
    }

    /// Creates an `Equal` matcher.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MatchOperator::Equal, value)
    }

    /// Creates a `NotEqual` matcher.
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MatchOperator::NotEqual, value)
    }

    /// Creates a `RegexMatch` matcher.
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, MatchOperator::RegexMatch, pattern)
    }

    /// Creates a `RegexNotMatch` matcher.
    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, MatchOperator::RegexNotMatch, pattern)
    }

    /// Validates the matcher and compiles it for evaluation.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the name or value length is out
    /// of bounds or the regular expression does not compile.
    pub fn compile(&self) -> Result<CompiledMatcher> {
        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > Self::MAX_NAME_LENGTH {
            return Err(SilenceError::validation(format!(
                "matcher name must be 1..={} characters",
                Self::MAX_NAME_LENGTH
            )));
        }

        let value_len = self.value.chars().count();
        if value_len == 0 || value_len > Self::MAX_VALUE_LENGTH {
            return Err(SilenceError::validation(format!(
                "matcher value for '{}' must be 1..={} characters",
                self.name,
                Self::MAX_VALUE_LENGTH
            )));
        }

        let negated = self.operator.is_negated();
        if self.operator.is_regex() {
            let invalid = |e: regex::Error| {
                SilenceError::validation(format!("invalid regex for matcher '{}': {e}", self.name))
            };
            // The bare pattern must parse on its own, otherwise input like
            // `a)|(b` would escape the anchoring group.
            RegexBuilder::new(&self.value)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(invalid)?;
            let pattern = RegexBuilder::new(&format!("^(?:{})$", self.value))
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(invalid)?;
            Ok(CompiledMatcher::Regex {
                name: self.name.clone(),
                pattern,
                negated,
            })
        } else {
            Ok(CompiledMatcher::Literal {
                name: self.name.clone(),
                value: self.value.clone(),
                negated,
            })
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let escaped = self.value.replace('\\', "\\\\").replace('"', "\\\"");
        write!(f, "{}{}\"{}\"", self.name, self.operator, escaped)
    }
}

impl FromStr for Matcher {
    type Err = SilenceError;

    /// Parses `name="value"`, `name!="value"`, `name=~"regex"` or
    /// `name!~"regex"`. Quotes around the value are optional.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| c == '=' || c == '!')
            .ok_or_else(|| SilenceError::validation(format!("matcher '{s}' has no operator")))?;
        let (name, rest) = s.split_at(split);

        let (operator, raw_value) = if let Some(v) = rest.strip_prefix("=~") {
            (MatchOperator::RegexMatch, v)
        } else if let Some(v) = rest.strip_prefix("!~") {
            (MatchOperator::RegexNotMatch, v)
        } else if let Some(v) = rest.strip_prefix("!=") {
            (MatchOperator::NotEqual, v)
        } else if let Some(v) = rest.strip_prefix('=') {
            (MatchOperator::Equal, v)
        } else {
            return Err(SilenceError::validation(format!(
                "matcher '{s}' has an unknown operator"
            )));
        };

        let raw_value = raw_value.trim();
        let value = match raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
        {
            Some(quoted) => unescape(quoted),
            None => raw_value.to_string(),
        };

        Ok(Self::new(name.trim(), operator, value))
    }
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A validated matcher ready for evaluation.
#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    /// Literal (in)equality.
    Literal {
        /// The label key.
        name: String,
        /// The expected value.
        value: String,
        /// Whether the comparison is negated.
        negated: bool,
    },
    /// Anchored regular expression.
    Regex {
        /// The label key.
        name: String,
        /// The compiled `^(?:...)$` pattern.
        pattern: Regex,
        /// Whether the match is negated.
        negated: bool,
    },
}

impl CompiledMatcher {
    /// Returns the label key this matcher inspects.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Literal { name, .. } | Self::Regex { name, .. } => name,
        }
    }

    /// Evaluates the matcher against a single label value.
    #[must_use]
    pub fn matches_value(&self, actual: &str) -> bool {
        match self {
            Self::Literal { value, negated, .. } => (actual == value) != *negated,
            Self::Regex {
                pattern, negated, ..
            } => pattern.is_match(actual) != *negated,
        }
    }

    /// Evaluates the matcher against a label set.
    ///
    /// A missing label is compared as the empty string.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(self.name()).map_or("", String::as_str);
        self.matches_value(actual)
    }
}

/// Compiles a list of matchers, failing on the first invalid one.
///
/// # Errors
///
/// Returns `SilenceError::Validation` if any matcher is invalid.
pub fn compile_all(matchers: &[Matcher]) -> Result<Vec<CompiledMatcher>> {
    matchers.iter().map(Matcher::compile).collect()
}

/// Returns true if every matcher matches the label set.
#[must_use]
pub fn matches_all(matchers: &[CompiledMatcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_case(MatchOperator::Equal, "critical", "critical", true; "equal hit")]
    #[test_case(MatchOperator::Equal, "critical", "warning", false; "equal miss")]
    #[test_case(MatchOperator::NotEqual, "critical", "warning", true; "not equal hit")]
    #[test_case(MatchOperator::NotEqual, "critical", "critical", false; "not equal miss")]
    #[test_case(MatchOperator::RegexMatch, "crit.*", "critical", true; "regex hit")]
    #[test_case(MatchOperator::RegexMatch, "crit", "critical", false; "regex is anchored")]
    #[test_case(MatchOperator::RegexNotMatch, "crit.*", "warning", true; "not regex hit")]
    #[test_case(MatchOperator::RegexNotMatch, "crit.*", "critical", false; "not regex miss")]
    fn test_operator_semantics(op: MatchOperator, value: &str, actual: &str, expected: bool) {
        let m = Matcher::new("severity", op, value).compile().unwrap();
        assert_eq!(m.matches(&labels(&[("severity", actual)])), expected);
    }

    #[test]
    fn test_regex_alternation() {
        let m = Matcher::regex("severity", "critical|warning").compile().unwrap();
        assert!(m.matches(&labels(&[("severity", "warning")])));
        assert!(!m.matches(&labels(&[("severity", "info")])));
    }

    #[test]
    fn test_missing_label_is_empty_string() {
        let eq = Matcher::equal("team", "ops").compile().unwrap();
        let ne = Matcher::not_equal("team", "ops").compile().unwrap();
        let re = Matcher::regex("team", ".*").compile().unwrap();
        let empty = LabelSet::new();

        assert!(!eq.matches(&empty));
        assert!(ne.matches(&empty));
        assert!(re.matches(&empty));
    }

    #[test]
    fn test_all_matchers_must_match() {
        let matchers = compile_all(&[
            Matcher::equal("alertname", "HighCPU"),
            Matcher::equal("severity", "critical"),
        ])
        .unwrap();

        assert!(matches_all(
            &matchers,
            &labels(&[("alertname", "HighCPU"), ("severity", "critical"), ("instance", "x")])
        ));
        assert!(!matches_all(
            &matchers,
            &labels(&[("alertname", "HighCPU"), ("severity", "warning")])
        ));
    }

    #[test]
    fn test_invalid_regex_is_validation_error() {
        let err = Matcher::regex("job", "(unclosed").compile().unwrap_err();
        assert!(matches!(err, SilenceError::Validation { ref reason } if reason.contains("invalid regex")));
    }

    #[test_case("a)|(b"; "unbalanced group")]
    #[test_case(")"; "stray close")]
    fn test_pattern_cannot_escape_anchoring(value: &str) {
        let err = Matcher::regex("job", value).compile().unwrap_err();
        assert!(err.is_validation());
        assert!(Matcher::not_regex("job", value).compile().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(Matcher::equal("", "x").compile().is_err());
    }

    #[test]
    fn test_empty_value_rejected() {
        assert!(Matcher::equal("job", "").compile().is_err());
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let long_name = "n".repeat(Matcher::MAX_NAME_LENGTH + 1);
        assert!(Matcher::equal(long_name, "x").compile().is_err());

        let long_value = "v".repeat(Matcher::MAX_VALUE_LENGTH + 1);
        assert!(Matcher::equal("job", long_value).compile().is_err());

        let max_value = "v".repeat(Matcher::MAX_VALUE_LENGTH);
        assert!(Matcher::equal("job", max_value).compile().is_ok());
    }

    #[test]
    fn test_parse_all_operators() {
        let cases = [
            ("job=\"api\"", MatchOperator::Equal),
            ("job!=\"api\"", MatchOperator::NotEqual),
            ("job=~\"api|web\"", MatchOperator::RegexMatch),
            ("job!~\"api|web\"", MatchOperator::RegexNotMatch),
        ];
        for (text, op) in cases {
            let m: Matcher = text.parse().unwrap();
            assert_eq!(m.name, "job");
            assert_eq!(m.operator, op);
        }
    }

    #[test]
    fn test_parse_unquoted_and_escaped() {
        let m: Matcher = "env = prod".parse().unwrap();
        assert_eq!(m, Matcher::equal("env", "prod"));

        let m: Matcher = r#"msg="say \"hi\"""#.parse().unwrap();
        assert_eq!(m.value, r#"say "hi""#);
        assert_eq!(m.to_string(), r#"msg="say \"hi\"""#);
    }

    #[test]
    fn test_parse_without_operator_fails() {
        assert!("just-a-name".parse::<Matcher>().is_err());
        assert!("job!\"x\"".parse::<Matcher>().is_err());
    }

    #[test]
    fn test_operator_serializes_as_symbol() {
        let json = serde_json::to_string(&Matcher::regex("job", "a.*")).unwrap();
        assert!(json.contains(r#""operator":"=~""#));
    }

    fn arb_matcher() -> impl Strategy<Value = Matcher> {
        (
            prop::sample::select(vec!["alertname", "severity", "team", "instance"]),
            prop::sample::select(vec![
                MatchOperator::Equal,
                MatchOperator::NotEqual,
                MatchOperator::RegexMatch,
                MatchOperator::RegexNotMatch,
            ]),
            prop::sample::select(vec!["a", "b", "a|b", "c.*", "x"]),
        )
            .prop_map(|(n, op, v)| Matcher::new(n, op, v))
    }

    fn arb_labels() -> impl Strategy<Value = LabelSet> {
        prop::collection::hash_map(
            prop::sample::select(vec!["alertname", "severity", "team", "instance"])
                .prop_map(str::to_string),
            prop::sample::select(vec!["a", "b", "cat", "x", ""]).prop_map(str::to_string),
            0..4,
        )
    }

    proptest! {
        #[test]
        fn prop_evaluation_is_order_independent(
            matchers in prop::collection::vec(arb_matcher(), 1..6),
            labels in arb_labels(),
        ) {
            let forward = compile_all(&matchers).unwrap();
            let mut reversed = forward.clone();
            reversed.reverse();
            let mut rotated = forward.clone();
            rotated.rotate_left(1);

            let expected = matches_all(&forward, &labels);
            prop_assert_eq!(matches_all(&reversed, &labels), expected);
            prop_assert_eq!(matches_all(&rotated, &labels), expected);
            prop_assert_eq!(matches_all(&forward, &labels), expected);
        }

        #[test]
        fn prop_negation_is_complement(m in arb_matcher(), labels in arb_labels()) {
            let flipped_op = match m.operator {
                MatchOperator::Equal => MatchOperator::NotEqual,
                MatchOperator::NotEqual => MatchOperator::Equal,
                MatchOperator::RegexMatch => MatchOperator::RegexNotMatch,
                MatchOperator::RegexNotMatch => MatchOperator::RegexMatch,
            };
            let flipped = Matcher::new(m.name.clone(), flipped_op, m.value.clone());
            let a = m.compile().unwrap().matches(&labels);
            let b = flipped.compile().unwrap().matches(&labels);
            prop_assert_ne!(a, b);
        }
    }
}
