//! Host-facing key broker
//!
//! The [`Orchestrator`] selects the native dialect once, keeps the current
//! [`SourceContext`] and dispatches encrypted signals to it. Failures of
//! signal handling are delivered to the error sink on the event bus.

use crate::cdm::{DialectAdapter, SignalPolicy};
use crate::config::{EmeOptions, KeySystemOptions, SourceDescriptor};
use crate::context::{SessionRequest, SourceContext};
use crate::dialect::Platform;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventRecord};
use crate::negotiate::candidate_configurations;
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{Dialect, DrmSystem};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Content type used to probe key system support
const PROBE_CONTENT_TYPE: &str = "video/mp4;codecs=\"avc1.42E01E\"";

/// Encrypted signal raised by the media element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSignal {
    pub init_data_type: String,
    pub init_data: Option<Bytes>,
}

impl EncryptedSignal {
    pub fn new(init_data_type: impl Into<String>, init_data: impl Into<Bytes>) -> Self {
        Self {
            init_data_type: init_data_type.into(),
            init_data: Some(init_data.into()),
        }
    }
}

/// Support of one DRM system by the selected dialect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CdmSupport {
    pub system: DrmSystem,
    pub key_system: &'static str,
    pub supported: bool,
}

#[derive(Default)]
struct Debounce {
    handled_first: bool,
    pending: Option<JoinHandle<()>>,
}

impl Debounce {
    fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.handled_first = false;
    }
}

struct State {
    options: EmeOptions,
    source: SourceDescriptor,
    context: Option<Arc<SourceContext>>,
    debounce: Debounce,
}

struct Inner {
    adapter: Option<Arc<dyn DialectAdapter>>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    state: RwLock<State>,
}

/// Decryption key broker for one media element
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create a broker using the default HTTP transport
    pub fn new(platform: Platform, options: EmeOptions) -> Self {
        Self::with_transport(platform, options, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(platform: Platform, options: EmeOptions, transport: Arc<dyn Transport>) -> Self {
        let adapter = platform.select();
        match &adapter {
            Some(adapter) => info!(dialect = %adapter.dialect(), "Content protection dialect selected"),
            None => info!("No content protection API available"),
        }

        Self {
            inner: Arc::new(Inner {
                adapter,
                transport,
                events: EventBus::new(),
                state: RwLock::new(State {
                    options,
                    source: SourceDescriptor::default(),
                    context: None,
                    debounce: Debounce::default(),
                }),
            }),
        }
    }

    /// Selected native dialect
    pub fn dialect(&self) -> Option<Dialect> {
        self.inner.adapter.as_ref().map(|adapter| adapter.dialect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Replace the global options; applies to source contexts created afterwards
    pub async fn set_options(&self, options: EmeOptions) {
        self.inner.state.write().await.options = options;
    }

    pub async fn options(&self) -> EmeOptions {
        self.inner.state.read().await.options.clone()
    }

    /// Switch to a new source, closing every session of the previous one
    #[instrument(skip(self, source), fields(src = %source.src))]
    pub async fn load_source(&self, source: SourceDescriptor) {
        let mut state = self.inner.state.write().await;
        state.debounce.reset();

        // Closed under the lock so no signal can reach a new context first
        if let Some(previous) = state.context.take() {
            debug!(previous = %previous.source(), "Closing previous source context");
            previous.close_all().await;
        }
        state.source = source;
    }

    /// Handle an encrypted signal with its init data
    pub async fn handle_signal(&self, signal: EncryptedSignal) -> Result<()> {
        let Some(adapter) = &self.inner.adapter else {
            debug!("Encrypted signal without a content protection API");
            return Ok(());
        };

        match adapter.signal_policy() {
            SignalPolicy::Debounced => self.debounce(signal).await,
            SignalPolicy::Immediate | SignalPolicy::SingleSession => self.dispatch(signal).await,
        }
    }

    /// Provision the key container without waiting for an encrypted signal
    pub async fn initialize_media_keys(&self, suppress_error: bool) -> Result<()> {
        let Some(context) = self.context().await else {
            return Ok(());
        };

        match context.request_session(SessionRequest::provision_only()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !suppress_error && !matches!(err, Error::Closed) {
                    self.inner.events.error(&err);
                }
                Err(err)
            }
        }
    }

    /// Probe which well-known DRM systems the selected dialect supports
    pub async fn detect_supported_cdms(&self) -> Vec<CdmSupport> {
        let mut support = Vec::with_capacity(DrmSystem::ALL.len());

        for system in DrmSystem::ALL {
            let key_system = system.key_system();
            let supported = match &self.inner.adapter {
                Some(adapter) => {
                    let probe = KeySystemOptions::new().with_video_content_type(PROBE_CONTENT_TYPE);
                    let configurations = candidate_configurations(key_system, &probe);
                    adapter.request_access(key_system, &configurations).await.is_ok()
                }
                None => false,
            };
            debug!(%system, supported, "CDM probe");
            support.push(CdmSupport {
                system,
                key_system,
                supported,
            });
        }

        support
    }

    /// Sessions registered for the current source
    pub async fn session_count(&self) -> usize {
        self.inner
            .state
            .read()
            .await
            .context
            .as_ref()
            .map_or(0, |context| context.session_count())
    }

    /// Close every session; later signals start from a fresh context
    pub async fn dispose(&self) {
        let mut state = self.inner.state.write().await;
        state.debounce.reset();
        if let Some(context) = state.context.take() {
            context.close_all().await;
        }
        info!("Key broker disposed");
    }

    /// Current source context, created on first use
    async fn context(&self) -> Option<Arc<SourceContext>> {
        let adapter = self.inner.adapter.as_ref()?;
        let mut state = self.inner.state.write().await;
        if let Some(context) = &state.context {
            return Some(Arc::clone(context));
        }

        let options = state.options.for_source(&state.source);
        if options.key_systems.is_empty() {
            debug!("No key systems configured, ignoring");
            return None;
        }

        let context = Arc::new(SourceContext::new(
            state.source.src.clone(),
            Arc::clone(adapter),
            options,
            Arc::clone(&self.inner.transport),
            self.inner.events.clone(),
        ));
        state.context = Some(Arc::clone(&context));
        Some(context)
    }

    async fn dispatch(&self, signal: EncryptedSignal) -> Result<()> {
        let Some(context) = self.context().await else {
            return Ok(());
        };

        let request = SessionRequest {
            init_data_type: signal.init_data_type,
            init_data: signal.init_data,
        };
        match context.request_session(request).await {
            Ok(()) => Ok(()),
            Err(Error::Closed) => {
                debug!("Source closed before the session was ready");
                Err(Error::Closed)
            }
            Err(err) => {
                self.inner.events.error(&err);
                Err(err)
            }
        }
    }

    /// Debounce the first burst of signals of a source.
    ///
    /// Each signal inside the window replaces the pending one; once a signal
    /// has been handled, later ones go straight through.
    async fn debounce(&self, signal: EncryptedSignal) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.debounce.handled_first {
            drop(state);
            return self.dispatch(signal).await;
        }

        if let Some(previous) = state.debounce.pending.take() {
            debug!("Replacing pending needkey signal");
            previous.abort();
        }

        let window = state.options.debounce_window();
        let this = self.clone();
        state.debounce.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut state = this.inner.state.write().await;
                state.debounce.handled_first = true;
                state.debounce.pending = None;
            }
            let _ = this.dispatch(signal).await;
        }));

        Ok(())
    }
}
