//! Verification gate: admission control for task claiming.
//!
//! A worker must declare every capability its stream requires before it may
//! claim anything. This guards against a worker producing output under an
//! assumed capability set it never loaded; it is not an optimization.

use crate::error::{OrchestratorError, Result};
use crate::model::{TaskId, WorkerId};
use crate::registry::StreamRegistry;
use crate::store::TaskStore;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct VerificationGate {
    registry: Arc<StreamRegistry>,
    /// worker -> stream the worker verified against. Presence means
    /// verified; the transition is one-way.
    verified: DashMap<WorkerId, String>,
}

impl VerificationGate {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            verified: DashMap::new(),
        }
    }

    /// Declare the capabilities a worker has loaded. Verification succeeds
    /// only when every entry of the stream's requirement list is covered, in
    /// any order, with no omissions. Extra capabilities are fine.
    pub fn declare_capabilities(
        &self,
        worker: &WorkerId,
        stream: &str,
        declared: &[String],
    ) -> Result<()> {
        let required = self.registry.required_capabilities(stream)?;
        let declared: HashSet<&str> = declared.iter().map(|c| c.as_str()).collect();
        let missing: Vec<String> = required
            .iter()
            .filter(|cap| !declared.contains(cap.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(
                "Worker {} failed verification for stream {}: missing {:?}",
                worker, stream, missing
            );
            return Err(OrchestratorError::NotVerified {
                worker: worker.clone(),
                missing,
            });
        }
        info!("Worker {} verified for stream {}", worker, stream);
        self.verified.insert(worker.clone(), stream.to_string());
        Ok(())
    }

    pub fn is_verified(&self, worker: &WorkerId) -> bool {
        self.verified.contains_key(worker)
    }

    /// Claim-path guard. Pure check: never touches the task store.
    pub fn ensure_verified(&self, worker: &WorkerId) -> Result<()> {
        if self.is_verified(worker) {
            return Ok(());
        }
        Err(OrchestratorError::NotVerified {
            worker: worker.clone(),
            missing: vec![],
        })
    }

    /// Coordinator-side sweep: any task claimed by a worker that never
    /// passed the gate is returned to `Pending`. Returns the revoked ids.
    pub fn revoke_unverified_claims(&self, store: &TaskStore) -> Vec<TaskId> {
        let mut revoked = Vec::new();
        for (task_id, worker) in store.claimed_tasks() {
            if !self.is_verified(&worker) {
                warn!(
                    "Revoking claim on {} held by unverified worker {}",
                    task_id, worker
                );
                if store.release(&task_id).is_ok() {
                    revoked.push(task_id);
                }
            }
        }
        revoked
    }
}
