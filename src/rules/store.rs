//! Ordered rule storage with snapshot reads

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use super::Rule;
use crate::error::RuleError;

/// Rules in application order
#[derive(Default)]
pub struct RuleStore {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RuleStore {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Current rule list; cheap to take per request
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    pub fn list(&self) -> Vec<Rule> {
        self.snapshot().as_ref().clone()
    }

    /// Insert or replace by id, keeping the existing position on replace
    pub fn save(&self, rule: Rule) -> Result<(), RuleError> {
        rule.matcher()?;

        let mut guard = self.rules.write();
        let mut rules = guard.as_ref().clone();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        *guard = Arc::new(rules);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), RuleError> {
        let mut guard = self.rules.write();
        if !guard.iter().any(|r| r.id == id) {
            return Err(RuleError::NotFound(id.to_string()));
        }
        let rules: Vec<Rule> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(rules);
        Ok(())
    }

    /// Load rules from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules from {:?}", path))?;
        let rules: Vec<Rule> = serde_json::from_str(&contents).context("Failed to parse rules file")?;
        tracing::info!("Loaded {} rules from {:?}", rules.len(), path);
        Ok(Self::new(rules))
    }

    /// Write rules to a JSON file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self.snapshot().as_ref())?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
