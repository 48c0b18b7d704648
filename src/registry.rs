use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    completion::CancelReason,
    request::{CorrelatedRequest, RequestKey},
};

/// What `put` does when the key already maps to an unresolved request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Refuse the newer request; the in-flight one is untouched.
    #[default]
    Reject,
    /// Replace the in-flight request and settle it as superseded.
    Supersede,
}

/// Concurrent map of in-flight requests keyed by caller identity.
///
/// At most one live entry exists per key. The registry owns its
/// synchronization; callers never lock.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: DashMap<RequestKey, Arc<CorrelatedRequest>>,
    policy: DuplicatePolicy,
}

impl RequestRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            requests: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Registers a request under its key.
    ///
    /// An existing entry whose signal is already settled is stale (its
    /// coordinator is about to clean it up) and is replaced silently. An
    /// unresolved entry is handled per [`DuplicatePolicy`]. Returns the
    /// replaced request, if any.
    pub fn put(
        &self,
        request: Arc<CorrelatedRequest>,
    ) -> RegistryResult<Option<Arc<CorrelatedRequest>>> {
        if request.key().is_blank() {
            return Err(RegistryError::InvalidKey);
        }

        let replaced = match self.requests.entry(request.key().clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(request);
                return Ok(None);
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().completion().is_settled() {
                    debug!(key = %request.key(), "replacing settled registry entry");
                    return Ok(Some(occupied.insert(request)));
                }
                match self.policy {
                    DuplicatePolicy::Reject => {
                        return Err(RegistryError::DuplicateRequest {
                            key: request.key().clone(),
                        });
                    }
                    DuplicatePolicy::Supersede => occupied.insert(request),
                }
            }
        };

        // Settled outside the shard lock: waking the evicted waiter makes it
        // run cleanup against this map.
        warn!(
            key = %replaced.key(),
            request_id = %replaced.request_id(),
            "superseding in-flight request"
        );
        replaced.cancel(CancelReason::Superseded);
        Ok(Some(replaced))
    }

    pub fn get(&self, key: &RequestKey) -> Option<Arc<CorrelatedRequest>> {
        self.requests.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.requests.contains_key(key)
    }

    /// Removes whatever is registered under `key`. Safe when absent.
    pub fn remove(&self, key: &RequestKey) -> Option<Arc<CorrelatedRequest>> {
        self.requests.remove(key).map(|(_, request)| request)
    }

    /// Removes the entry for `request.key()` only if it is this very request,
    /// so that cleanup of a superseded call never deletes its successor.
    pub fn remove_request(&self, request: &CorrelatedRequest) -> bool {
        self.requests
            .remove_if(request.key(), |_, current| current.is_same_request(request))
            .is_some()
    }

    /// Removes every entry and settles it as cancelled. Returns how many
    /// unresolved requests were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut cancelled = 0;
        for key in self.keys() {
            if let Some(request) = self.remove(&key) {
                if request.cancel(reason) {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    pub fn keys(&self) -> Vec<RequestKey> {
        self.requests.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Request already in flight for key: {key}")]
    DuplicateRequest { key: RequestKey },
    #[error("Request key must not be empty")]
    InvalidKey,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
