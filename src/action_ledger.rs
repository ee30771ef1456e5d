//! In-memory store of staged actions awaiting confirmation.
//!
//! The ledger lives for the lifetime of the process and is shared through an
//! `Arc`. Its lock is held only for map operations, never across an await
//! point, so slow provider calls made around it never block other requests.

use crate::error::BridgeError;
use crate::plan_generator::{Plan, ResourceType};
use crate::providers::{SystemTimeProvider, TimeProvider};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default time a staged action stays consumable.
pub const DEFAULT_ACTION_TTL: Duration = Duration::from_secs(600);

/// A staged, immutable change descriptor.
///
/// Holds no credentials: those are derived again at apply time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub action_id: String,
    pub request: String,
    pub resource_type: ResourceType,
    pub resource_config: Value,
    pub rendered_artifact: String,
    /// Unix milliseconds.
    pub created_at: u64,
}

pub struct ActionLedger {
    entries: Mutex<HashMap<String, PendingAction>>,
    clock: Box<dyn TimeProvider>,
    ttl: Duration,
}

impl ActionLedger {
    pub fn new(ttl: Duration) -> Self {
        Self::with_time_provider(ttl, Box::new(SystemTimeProvider))
    }

    /// Creates a ledger with a custom time provider (for testing).
    pub fn with_time_provider(ttl: Duration, clock: Box<dyn TimeProvider>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingAction>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &PendingAction, now: u64, max_age: Duration) -> bool {
        u128::from(now.saturating_sub(entry.created_at)) > max_age.as_millis()
    }

    /// Stages an actionable plan and returns its opaque id.
    pub fn stage(&self, request: &str, plan: &Plan) -> Result<String, BridgeError> {
        let resource_type = plan
            .resource_type
            .filter(|_| plan.is_actionable())
            .ok_or_else(|| BridgeError::validation("Only actionable plans can be staged"))?;

        self.sweep(self.ttl);

        // UUIDv7 carries its creation time in the leading bits.
        let action_id = Uuid::now_v7().to_string();
        let entry = PendingAction {
            action_id: action_id.clone(),
            request: request.to_string(),
            resource_type,
            resource_config: plan.resource_config.clone(),
            rendered_artifact: plan.rendered_artifact.clone(),
            created_at: self.clock.now_millis(),
        };

        self.entries().insert(action_id.clone(), entry);
        info!("Staged {} action {}", resource_type.label(), action_id);
        Ok(action_id)
    }

    /// Removes and returns the staged action.
    ///
    /// Unknown, consumed and expired ids all yield the same `NotFound`.
    pub fn consume(&self, action_id: &str) -> Result<PendingAction, BridgeError> {
        let now = self.clock.now_millis();
        let entry = self.entries().remove(action_id);

        match entry {
            Some(entry) if !self.is_expired(&entry, now, self.ttl) => {
                info!("Consumed action {}", action_id);
                Ok(entry)
            }
            Some(_) => {
                debug!("Action {} expired before consumption", action_id);
                Err(BridgeError::NotFound)
            }
            None => Err(BridgeError::NotFound),
        }
    }

    /// Drops a staged action the user declined. Returns whether it existed.
    pub fn discard(&self, action_id: &str) -> bool {
        let removed = self.entries().remove(action_id).is_some();
        if removed {
            info!("Discarded action {}", action_id);
        }
        removed
    }

    /// Drops entries older than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now, max_age));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired actions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
