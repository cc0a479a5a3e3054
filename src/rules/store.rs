//! The active rule set, replaced wholesale on reload.

use std::sync::{Arc, RwLock};

use tracing::info;

use super::RuleSet;
use crate::error::RuleValidationError;

/// Copy-on-write holder of the current rule generation.
///
/// Readers clone the inner `Arc` and keep using their generation for as long
/// as they need it; [`RuleStore::swap`] only replaces the reference.
#[derive(Debug, Default)]
pub struct RuleStore {
    active: RwLock<Arc<RuleSet>>,
    errors: RwLock<Vec<RuleValidationError>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.
    pub fn current(&self) -> Arc<RuleSet> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install a new generation and return the previous one.
    pub fn swap(&self, rules: RuleSet, errors: Vec<RuleValidationError>) -> Arc<RuleSet> {
        let next = Arc::new(rules);
        let previous = {
            let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, next.clone())
        };
        *self.errors.write().unwrap_or_else(|e| e.into_inner()) = errors;
        info!(
            previous = previous.len(),
            current = next.len(),
            "rule set swapped"
        );
        previous
    }

    /// Validation errors from the most recent load.
    pub fn errors(&self) -> Vec<RuleValidationError> {
        self.errors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
