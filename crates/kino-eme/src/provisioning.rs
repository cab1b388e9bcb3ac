//! Provisioning barrier
//!
//! Serializes creation of the shared key container of a source. The first
//! request starts provisioning; requests arriving meanwhile queue up and are
//! released in arrival order once the container is ready, or rejected
//! together when provisioning fails.
//!
//! ```text
//! Unprovisioned ──admit──▶ Provisioning ──ready──▶ Ready
//!                               │
//!                               └──fail──▶ Failed
//! ```

use crate::error::Error;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Observable barrier phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    Unprovisioned,
    Provisioning,
    Ready,
    Failed,
}

enum BarrierState<R, T> {
    Unprovisioned,
    Provisioning(VecDeque<R>),
    Ready(Arc<T>),
    Failed(Error),
}

/// Outcome of admitting a request
pub enum Admission<R, T> {
    /// Caller must run provisioning; the request is queued first in line
    Provision,
    /// Provisioning is in flight, the request waits in the queue
    Queued,
    /// Container available, handle the request now
    Ready(Arc<T>, R),
    /// Provisioning failed earlier
    Failed(R, Error),
}

/// Barrier over requests `R` and the provisioned resource `T`
pub struct ProvisioningBarrier<R, T> {
    state: Mutex<BarrierState<R, T>>,
}

impl<R, T> ProvisioningBarrier<R, T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::Unprovisioned),
        }
    }

    pub async fn admit(&self, request: R) -> Admission<R, T> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, BarrierState::Unprovisioned) {
            BarrierState::Unprovisioned => {
                *state = BarrierState::Provisioning(VecDeque::from([request]));
                debug!("Provisioning started");
                Admission::Provision
            }
            BarrierState::Provisioning(mut queue) => {
                queue.push_back(request);
                debug!(queued = queue.len(), "Request queued behind provisioning");
                *state = BarrierState::Provisioning(queue);
                Admission::Queued
            }
            BarrierState::Ready(resource) => {
                *state = BarrierState::Ready(Arc::clone(&resource));
                Admission::Ready(resource, request)
            }
            BarrierState::Failed(err) => {
                *state = BarrierState::Failed(err.clone());
                Admission::Failed(request, err)
            }
        }
    }

    /// Take the queued requests, in arrival order, while still provisioning
    pub async fn drain(&self) -> Vec<R> {
        match &mut *self.state.lock().await {
            BarrierState::Provisioning(queue) => queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }

    /// Publish the resource and return requests that queued since the last drain
    pub async fn ready(&self, resource: Arc<T>) -> Vec<R> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, BarrierState::Ready(resource)) {
            BarrierState::Provisioning(queue) => queue.into(),
            previous => {
                // Closed or failed meanwhile
                *state = previous;
                Vec::new()
            }
        }
    }

    /// Enter the terminal failed state and return every queued request
    pub async fn fail(&self, err: Error) -> Vec<R> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, BarrierState::Failed(err)) {
            BarrierState::Provisioning(queue) => {
                warn!(queued = queue.len(), "Provisioning failed, rejecting queued requests");
                queue.into()
            }
            _ => Vec::new(),
        }
    }

    /// Ready resource, if any
    pub async fn resource(&self) -> Option<Arc<T>> {
        match &*self.state.lock().await {
            BarrierState::Ready(resource) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    pub async fn phase(&self) -> ProvisioningPhase {
        match &*self.state.lock().await {
            BarrierState::Unprovisioned => ProvisioningPhase::Unprovisioned,
            BarrierState::Provisioning(_) => ProvisioningPhase::Provisioning,
            BarrierState::Ready(_) => ProvisioningPhase::Ready,
            BarrierState::Failed(_) => ProvisioningPhase::Failed,
        }
    }
}

impl<R, T> Default for ProvisioningBarrier<R, T> {
    fn default() -> Self {
        Self::new()
    }
}
