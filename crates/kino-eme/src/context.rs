//! Per-source key session state
//!
//! A [`SourceContext`] owns everything tied to one loaded media source: the
//! session registry, the provisioning barrier and, once provisioned, the
//! shared key container. Switching sources closes the context.
//!
//! Provisioning sequence:
//!
//! ```text
//! negotiate ─▶ resolve options ─▶ certificate ─▶ create keys ─▶ install certificate
//!     ─▶ open queued sessions (FIFO) ─▶ attach keys ─▶ run sessions ─▶ ready
//! ```
//!
//! A container that cannot be attached fails the whole sequence: sessions
//! already opened for queued requests are closed and every request is
//! rejected with the provisioning error.

use crate::cdm::{DialectAdapter, MediaKeys, SignalPolicy};
use crate::config::{EmeOptions, NormalizedKeySystemOptions};
use crate::error::{Error, Result};
use crate::events::{EmeEvent, EventBus};
use crate::lifecycle::KeySessionLifecycle;
use crate::negotiate::KeySystemNegotiator;
use crate::provisioning::{Admission, ProvisioningBarrier, ProvisioningPhase};
use crate::registry::SessionRegistry;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

/// Request for a key session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub init_data_type: String,
    /// `None` provisions the container without creating a session
    pub init_data: Option<Bytes>,
}

impl SessionRequest {
    pub fn new(init_data_type: impl Into<String>, init_data: impl Into<Bytes>) -> Self {
        Self {
            init_data_type: init_data_type.into(),
            init_data: Some(init_data.into()),
        }
    }

    /// Provision the key container only
    pub fn provision_only() -> Self {
        Self {
            init_data_type: String::new(),
            init_data: None,
        }
    }
}

/// A session request waiting for, or released by, the provisioning barrier
pub(crate) struct PendingSessionRequest {
    pub request: SessionRequest,
    /// Consecutive expiry renewals without a usable key
    pub renewals: u32,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

impl PendingSessionRequest {
    pub fn resolve(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// Provisioned key container and the options it was provisioned with
pub(crate) struct Provisioned {
    pub media_keys: Arc<dyn MediaKeys>,
    pub options: NormalizedKeySystemOptions,
}

/// Outcome of starting a request on a provisioned container
enum Started {
    /// No init data; completes with the container
    Waiting(PendingSessionRequest),
    /// Native session created, lifecycle not running yet
    Opened(KeySessionLifecycle),
    /// Duplicate or failed to open; the caller has been answered
    Settled,
}

impl Started {
    fn launch(self) {
        match self {
            Started::Waiting(pending) => pending.resolve(Ok(())),
            Started::Opened(lifecycle) => {
                tokio::spawn(lifecycle.run());
            }
            Started::Settled => {}
        }
    }

    async fn reject(self, err: Error) {
        match self {
            Started::Waiting(pending) => pending.resolve(Err(err)),
            Started::Opened(lifecycle) => lifecycle.abandon(err).await,
            Started::Settled => {}
        }
    }
}

/// Key session state of one media source
pub struct SourceContext {
    source: String,
    adapter: Arc<dyn DialectAdapter>,
    options: EmeOptions,
    transport: Arc<dyn Transport>,
    events: EventBus,
    registry: SessionRegistry,
    barrier: ProvisioningBarrier<PendingSessionRequest, Provisioned>,
    closed: watch::Sender<bool>,
}

impl SourceContext {
    pub fn new(
        source: impl Into<String>,
        adapter: Arc<dyn DialectAdapter>,
        options: EmeOptions,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            source: source.into(),
            adapter,
            options,
            transport,
            events,
            registry: SessionRegistry::new(),
            barrier: ProvisioningBarrier::new(),
            closed,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Options snapshot this context provisions with
    pub fn options(&self) -> &EmeOptions {
        &self.options
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn phase(&self) -> ProvisioningPhase {
        self.barrier.phase().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Request a key session and wait until its first license is applied.
    ///
    /// Resolves immediately for duplicate init data and for provision-only
    /// requests once the container is ready.
    pub async fn request_session(self: &Arc<Self>, request: SessionRequest) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        Arc::clone(self)
            .enqueue(PendingSessionRequest {
                request,
                renewals: 0,
                done: Some(tx),
            })
            .await;

        rx.await.unwrap_or(Err(Error::Closed))
    }

    pub(crate) async fn enqueue(self: Arc<Self>, pending: PendingSessionRequest) {
        if self.is_closed() {
            pending.resolve(Err(Error::Closed));
            return;
        }

        match self.barrier.admit(pending).await {
            Admission::Provision => {
                // Detached so a cancelled caller cannot leave the barrier provisioning forever
                tokio::spawn(Arc::clone(&self).provision());
            }
            Admission::Queued => {}
            Admission::Ready(provisioned, pending) => self.start(&provisioned, pending).launch(),
            Admission::Failed(pending, err) => pending.resolve(Err(err)),
        }
    }

    #[instrument(skip(self), fields(source = %self.source))]
    async fn provision(self: Arc<Self>) {
        let provisioned = match self.prepare().await {
            Ok(provisioned) => Arc::new(provisioned),
            Err(err) => {
                warn!(error = %err, "Provisioning failed");
                for pending in self.barrier.fail(err.clone()).await {
                    pending.resolve(Err(err.clone()));
                }
                return;
            }
        };

        if self.is_closed() {
            debug!("Source closed during provisioning");
            return;
        }

        // Sessions are created in FIFO order but only run once the container is bound
        let started: Vec<Started> = self
            .barrier
            .drain()
            .await
            .into_iter()
            .map(|pending| self.start(&provisioned, pending))
            .collect();

        if let Err(e) = provisioned.media_keys.attach().await {
            let err = Error::provisioning(e);
            warn!(error = %err, "Failed to bind key container");
            for pending in self.barrier.fail(err.clone()).await {
                pending.resolve(Err(err.clone()));
            }
            for started in started {
                started.reject(err.clone()).await;
            }
            self.events.error(&err);
            return;
        }

        info!(key_system = %provisioned.options.key_system, "Key container ready");
        for started in started {
            started.launch();
        }
        for pending in self.barrier.ready(Arc::clone(&provisioned)).await {
            self.start(&provisioned, pending).launch();
        }
    }

    async fn prepare(&self) -> Result<Provisioned> {
        let access = KeySystemNegotiator::new(Arc::clone(&self.adapter))
            .negotiate(&self.options.key_systems)
            .await?;
        let options = self
            .options
            .normalize_key_system(access.key_system(), &self.transport)?;

        let certificate = match &options.certificate {
            Some(provider) => {
                let certificate = provider
                    .certificate(&options.key_system)
                    .await
                    .map_err(Error::provisioning)?;
                Some(certificate)
            }
            None => None,
        };

        let media_keys = access.create_media_keys().await.map_err(Error::provisioning)?;
        if let Some(certificate) = certificate {
            media_keys
                .set_server_certificate(certificate)
                .await
                .map_err(Error::provisioning)?;
        }

        Ok(Provisioned { media_keys, options })
    }

    /// Register the request and open its native session.
    ///
    /// Requests without init data are handed back untouched.
    fn start(self: &Arc<Self>, provisioned: &Arc<Provisioned>, mut pending: PendingSessionRequest) -> Started {
        if let Some(pssh) = &provisioned.options.pssh {
            pending.request.init_data = Some(pssh.clone());
        }

        let Some(init_data) = pending.request.init_data.clone() else {
            return Started::Waiting(pending);
        };

        let record = match self.adapter.signal_policy() {
            SignalPolicy::SingleSession => self.registry.register_single(),
            SignalPolicy::Immediate | SignalPolicy::Debounced => self.registry.register(&init_data),
        };
        let Some(record) = record else {
            pending.resolve(Ok(()));
            return Started::Settled;
        };

        debug!(record, bytes = init_data.len(), renewals = pending.renewals, "Opening key session");
        let mut lifecycle = KeySessionLifecycle::new(Arc::clone(self), Arc::clone(provisioned), record, init_data, pending);
        if lifecycle.open() {
            Started::Opened(lifecycle)
        } else {
            Started::Settled
        }
    }

    /// Close every session without renewal and reject further requests
    #[instrument(skip(self), fields(source = %self.source))]
    pub async fn close_all(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        for pending in self.barrier.fail(Error::Closed).await {
            pending.resolve(Err(Error::Closed));
        }

        for handle in self.registry.drain_handles() {
            let session_id = handle.session_id();
            if let Err(e) = handle.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close key session");
            }
            self.events.emit(EmeEvent::KeySessionClosed { session_id });
        }

        debug!("Source context closed");
    }
}
