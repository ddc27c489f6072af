//! # Record Conflict Strategies
//!
//! Pluggable reaction to concurrent record updates. The cluster only stores
//! and resolves a strategy by name; the strategy itself is consulted by the
//! layers above when an update arrives with a stale version.

use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::RecordId;

pub const VERSION_STRATEGY: &str = "version";

pub trait RecordConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decides what happens when a record stored at `stored_version` is
    /// updated by a caller that last saw `incoming_version`.
    fn on_update(&self, rid: RecordId, stored_version: i32, incoming_version: i32) -> Result<()>;
}

/// Default strategy: reject updates whose version lags the stored one.
pub struct VersionConflictStrategy;

impl RecordConflictStrategy for VersionConflictStrategy {
    fn name(&self) -> &'static str {
        VERSION_STRATEGY
    }

    fn on_update(&self, rid: RecordId, stored_version: i32, incoming_version: i32) -> Result<()> {
        if incoming_version < stored_version {
            bail!(
                "record {} was modified concurrently: stored version {} is newer than {}",
                rid,
                stored_version,
                incoming_version
            );
        }
        Ok(())
    }
}

/// Name-keyed registry of strategies. `version` is always registered.
pub struct ConflictStrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn RecordConflictStrategy>>>,
}

impl ConflictStrategyRegistry {
    pub fn new() -> Self {
        let registry = Self {
            strategies: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(VersionConflictStrategy));
        registry
    }

    pub fn register(&self, strategy: Arc<dyn RecordConflictStrategy>) {
        self.strategies
            .write()
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<dyn RecordConflictStrategy>> {
        match self.strategies.read().get(name) {
            Some(strategy) => Ok(Arc::clone(strategy)),
            None => bail!("unknown conflict strategy '{}'", name),
        }
    }
}

impl Default for ConflictStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
