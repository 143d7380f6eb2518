//! Match & Replace module
//!
//! Persistent rewrite rules applied to every request and response that
//! passes through the proxy.

mod engine;
mod store;

pub use engine::{apply_rules, Record};
pub use store::RuleStore;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Which half of an exchange a record comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// Which halves a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    Request,
    Response,
    Both,
}

/// Part of the record a rule rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Url,
    Headers,
    #[default]
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Literal,
    Regex,
}

/// A match & replace rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: String,
    pub enabled: bool,
    pub scope: RuleScope,
    pub target: RuleTarget,
    pub mode: MatchMode,
    pub case_sensitive: bool,

    /// Text or regex to find
    #[serde(rename = "match")]
    pub pattern: String,

    /// Replacement; regex mode expands `$1` / `${name}`
    pub replacement: String,

    /// For header rules: the header to overwrite
    pub header_name: Option<String>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enabled: true,
            scope: RuleScope::default(),
            target: RuleTarget::default(),
            mode: MatchMode::default(),
            case_sensitive: false,
            pattern: String::new(),
            replacement: String::new(),
            header_name: None,
        }
    }
}

impl Rule {
    /// Literal rule with a fresh id
    pub fn literal(target: RuleTarget, pattern: &str, replacement: &str) -> Self {
        Self {
            target,
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            ..Default::default()
        }
    }

    /// Regex rule with a fresh id
    pub fn regex(target: RuleTarget, pattern: &str, replacement: &str) -> Self {
        Self {
            mode: MatchMode::Regex,
            ..Self::literal(target, pattern, replacement)
        }
    }

    /// Rule that sets a header value
    pub fn set_header(name: &str, value: &str) -> Self {
        Self {
            header_name: Some(name.to_string()),
            ..Self::literal(RuleTarget::Headers, "", value)
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn applies_to(&self, direction: Direction) -> bool {
        self.enabled
            && match self.scope {
                RuleScope::Both => true,
                RuleScope::Request => direction == Direction::Request,
                RuleScope::Response => direction == Direction::Response,
            }
    }

    /// Compile the matcher for this rule
    pub fn matcher(&self) -> Result<Regex, RuleError> {
        let pattern = match self.mode {
            MatchMode::Literal => regex::escape(&self.pattern),
            MatchMode::Regex => self.pattern.clone(),
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(!self.case_sensitive)
            .build()
            .map_err(|e| RuleError::InvalidRegex {
                id: self.id.clone(),
                reason: e.to_string(),
            })
    }
}
