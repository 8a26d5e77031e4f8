//! Boolean tag-inclusion expressions.
//!
//! An expression such as `camel && 'test01' || !archived` is evaluated against one tag set
//! by substituting every tag reference with a literal and running the result through a
//! closed boolean evaluator. Tags present in the set become `true`; any other bare word or
//! quoted token becomes `false`.

mod expression;
mod scope;

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;
use tracing::warn;

pub use expression::ExpressionError;
pub use scope::{EmptyScopeError, TagScope};

/// Sorted tag set of one source record.
pub type TagSet = BTreeSet<String>;

/// Placeholder for "tag present" while the remaining words are still being rewritten.
/// The final pass must not see it as a word character.
const PRESENT_MARKER: &str = "\u{1}";

fn unresolved_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"'[^']*'|[A-Za-z_+#-][A-Za-z0-9_+#-]*").expect("token pattern is valid")
    })
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("tag expression '{expression}' rewritten to '{rewritten}' failed to evaluate: {source}")]
pub struct FilterError {
    pub expression: String,
    pub rewritten: String,
    #[source]
    pub source: ExpressionError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInclusionFilter {
    expression: String,
}

impl TagInclusionFilter {
    /// Accepts an expression only if it evaluates cleanly against the empty tag set.
    pub fn new(expression: impl Into<String>) -> Result<Self, FilterError> {
        let filter = Self {
            expression: expression.into(),
        };
        filter.evaluate(&TagSet::new())?;
        Ok(filter)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Substitutes tag references with boolean literals.
    ///
    /// Quoted references are replaced before bare ones, and longer tags before shorter
    /// ones so a tag that is a substring of another cannot clobber it.
    pub fn rewrite(&self, tags: &TagSet) -> String {
        let mut ordered: Vec<&str> = tags
            .iter()
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
            .collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut rewritten = self.expression.clone();
        for tag in &ordered {
            rewritten = rewritten.replace(&format!("'{tag}'"), PRESENT_MARKER);
        }
        for tag in &ordered {
            rewritten = rewritten.replace(tag, PRESENT_MARKER);
        }

        let rewritten = unresolved_token_pattern().replace_all(&rewritten, |caps: &Captures| {
            match &caps[0] {
                word @ ("true" | "false") => word.to_string(),
                _ => "false".to_string(),
            }
        });

        rewritten.replace(PRESENT_MARKER, "true")
    }

    pub fn evaluate(&self, tags: &TagSet) -> Result<bool, FilterError> {
        let rewritten = self.rewrite(tags);
        expression::evaluate(&rewritten).map_err(|source| FilterError {
            expression: self.expression.clone(),
            rewritten,
            source,
        })
    }

    /// Like `evaluate`, but an evaluation failure excludes the combination.
    pub fn includes(&self, tags: &TagSet) -> bool {
        match self.evaluate(tags) {
            Ok(included) => included,
            Err(error) => {
                warn!(
                    event = "tag_filter_evaluation_failed",
                    tags = ?tags,
                    error = %error,
                    "excluding tag combination"
                );
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn tag_set(tags: &[&str]) -> TagSet {
    tags.iter().map(|tag| tag.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tags() -> TagSet {
        tag_set(&["beats_input_codec_plain_applied", "camel", "test01", "filebeat"])
    }

    fn check(expression: &str) -> bool {
        TagInclusionFilter::new(expression)
            .expect("expression is valid")
            .evaluate(&sample_tags())
            .expect("evaluates")
    }

    #[test]
    fn included_combinations() {
        for expression in [
            "1",
            "!0",
            "camel",
            "'camel'",
            "camel || test77",
            "camel && test01",
            "beats_input_codec_plain_applied",
            "beats_input_codec_plain_applied || some_other_underscoredTAG",
            "'camel' || test77",
            "camel && 'test01'",
            "'beats_input_codec_plain_applied'",
            "'beats_input_codec_plain_applied' || 'some_other_underscoredTAG'",
            "camel && test01 && !'non_EXISTENT_TAG'",
            "camel && 'test71' || !'non_EXISTENT_TAG'",
        ] {
            assert!(check(expression), "{expression} should include");
        }
    }

    #[test]
    fn excluded_combinations() {
        for expression in [
            "0",
            "!'camel'",
            "camel && test01 && !filebeat",
            "'camel' && 'test01' && !'filebeat'",
            "missing",
        ] {
            assert!(!check(expression), "{expression} should exclude");
        }
    }

    #[test]
    fn literal_words_survive_substitution() {
        let filter = TagInclusionFilter::new("true && !false").expect("valid");
        assert_eq!(filter.rewrite(&TagSet::new()), "true && !false");
        assert!(filter.includes(&TagSet::new()));
    }

    #[test]
    fn substring_tags_do_not_clobber_longer_ones() {
        let filter = TagInclusionFilter::new("camel").expect("valid");
        assert!(filter.includes(&tag_set(&["cam", "camel"])));
        assert_eq!(filter.rewrite(&tag_set(&["cam", "camel"])), "true");
    }

    #[test]
    fn tags_with_symbols_are_matched() {
        let filter = TagInclusionFilter::new("'c#' || 'a+b'").expect("valid");
        assert!(filter.includes(&tag_set(&["c#"])));
        assert!(filter.includes(&tag_set(&["a+b"])));
        assert!(!filter.includes(&tag_set(&["rust"])));
    }

    #[test]
    fn malformed_expressions_are_rejected_up_front() {
        for expression in ["", "camel &&", "(camel", "camel & other", "camel; other"] {
            assert!(
                TagInclusionFilter::new(expression).is_err(),
                "{expression} should be rejected"
            );
        }
    }

    #[test]
    fn evaluation_failure_excludes_instead_of_panicking() {
        let filter = TagInclusionFilter::new("camel_x").expect("valid against empty set");
        let tags = tag_set(&["camel"]);
        assert!(filter.evaluate(&tags).is_err());
        assert!(!filter.includes(&tags));
    }
}
