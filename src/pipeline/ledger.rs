//! Idempotency ledger: which message ids have been fully handled, plus an
//! in-memory claim set so two overlapping cycles never dispatch the same
//! message at the same time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::StoreError;
use crate::store::RelayStore;

type ClaimSet = Arc<Mutex<HashSet<String>>>;

/// Durable processed-id ledger backed by the store.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn RelayStore>,
    claims: ClaimSet,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self {
            store,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        self.store.is_processed(message_id).await
    }

    /// Record `message_id` as handled. A second call for the same id is a
    /// no-op.
    pub async fn mark_processed(&self, message_id: &str) -> Result<(), StoreError> {
        let inserted = self.store.mark_processed(message_id).await?;
        if !inserted {
            debug!(message_id, "Message already in processed ledger");
        }
        Ok(())
    }

    /// Claim `message_id` for dispatch. Returns `None` while another cycle
    /// holds the claim. Dropping the guard releases it.
    pub fn try_claim(&self, message_id: &str) -> Option<DispatchClaim> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.insert(message_id.to_string()) {
            return None;
        }
        Some(DispatchClaim {
            message_id: message_id.to_string(),
            claims: Arc::clone(&self.claims),
        })
    }

    /// Number of ids currently claimed.
    pub fn claimed(&self) -> usize {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// RAII guard for a dispatch claim.
#[derive(Debug)]
pub struct DispatchClaim {
    message_id: String,
    claims: ClaimSet,
}

impl DispatchClaim {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Drop for DispatchClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(&self.message_id);
    }
}
