//! `when` predicates on branch/tag/ref.
//!
//! Variables select their value and tasks precompute their skip flag
//! by matching these predicates against the trigger annotations at
//! run-generation time.

use regex::Regex;
use serde::{Deserialize, Serialize};

use capstan_core::{Error, Result};

/// How a single condition matches its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Exact string equality.
    Simple,
    /// Anchored regular expression.
    Regexp,
}

/// One match condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenCondition {
    /// Match kind.
    #[serde(rename = "type")]
    pub match_type: MatchType,
    /// The literal value or pattern.
    #[serde(rename = "match")]
    pub pattern: String,
}

impl WhenCondition {
    /// Creates a simple equality condition.
    #[must_use]
    pub fn simple(pattern: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Simple,
            pattern: pattern.into(),
        }
    }

    /// Creates a regexp condition.
    #[must_use]
    pub fn regexp(pattern: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Regexp,
            pattern: pattern.into(),
        }
    }

    fn matches(&self, value: &str) -> Result<bool> {
        match self.match_type {
            MatchType::Simple => Ok(self.pattern == value),
            MatchType::Regexp => {
                let re = Regex::new(&format!("^(?:{})$", self.pattern)).map_err(|e| {
                    Error::bad_request(format!("invalid when pattern '{}': {e}", self.pattern))
                })?;
                Ok(re.is_match(value))
            }
        }
    }
}

/// Include/exclude condition lists for one dimension.
///
/// The value must match at least one include (an empty include list
/// matches everything) and no exclude.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhenConditions {
    /// Conditions that admit the value.
    #[serde(default)]
    pub include: Vec<WhenCondition>,
    /// Conditions that reject the value.
    #[serde(default)]
    pub exclude: Vec<WhenCondition>,
}

impl WhenConditions {
    fn matches(&self, value: &str) -> Result<bool> {
        if !self.include.is_empty() {
            let mut included = false;
            for condition in &self.include {
                if condition.matches(value)? {
                    included = true;
                    break;
                }
            }
            if !included {
                return Ok(false);
            }
        }
        for condition in &self.exclude {
            if condition.matches(value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A predicate over the trigger's branch, tag and ref.
///
/// Every specified dimension must match; a dimension that is
/// specified but absent from the trigger fails the predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct When {
    /// Branch conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<WhenConditions>,
    /// Tag conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<WhenConditions>,
    /// Full ref conditions.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub reference: Option<WhenConditions>,
}

/// Trigger values a `when` predicate is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhenContext<'a> {
    /// Branch name, if the trigger is a branch push or PR.
    pub branch: Option<&'a str>,
    /// Tag name, if the trigger is a tag push.
    pub tag: Option<&'a str>,
    /// The full git ref.
    pub reference: Option<&'a str>,
}

impl When {
    /// Evaluates the predicate.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an invalid regexp pattern.
    pub fn matches(&self, ctx: &WhenContext<'_>) -> Result<bool> {
        if let Some(conditions) = &self.branch {
            match ctx.branch {
                Some(branch) if conditions.matches(branch)? => {}
                _ => return Ok(false),
            }
        }
        if let Some(conditions) = &self.tag {
            match ctx.tag {
                Some(tag) if conditions.matches(tag)? => {}
                _ => return Ok(false),
            }
        }
        if let Some(conditions) = &self.reference {
            match ctx.reference {
                Some(reference) if conditions.matches(reference)? => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
