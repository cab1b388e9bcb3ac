//! Machinery shared by the vendor-prefixed dialects
//!
//! Both legacy APIs expose synchronous key objects: a key container created
//! from a key system name, bound to the element with a setter, and sessions
//! created with a content type and the init data in one call. Sessions raise
//! `keymessage`, `keyadded` and `keyerror` events.
//!
//! Here they are lifted to the [`crate::cdm`] interface. Native session
//! creation is deferred to `generate_request`, where the init data is known.

use crate::cdm::{GenerateRequest, KeySystemAccess, MediaKeySession, MediaKeys, NativeSession, SessionEvent};
use crate::content_id::encode_utf16_le;
use crate::error::{NativeError, NativeResult};
use crate::pssh::find_pssh;
use crate::types::{DrmSystem, KeySystemFamily, MessageType, LEGACY_CONTENT_TYPE};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Host binding of `WebKitMediaKeys` or `MSMediaKeys` and the element setter
pub trait LegacyRuntime: Send + Sync {
    fn is_type_supported(&self, key_system: &str, content_type: &str) -> bool;

    fn create_media_keys(&self, key_system: &str) -> NativeResult<Arc<dyn LegacyMediaKeys>>;

    /// `webkitSetMediaKeys` / `msSetMediaKeys`
    fn set_media_keys(&self, keys: Arc<dyn LegacyMediaKeys>) -> NativeResult<()>;
}

pub trait LegacyMediaKeys: Send + Sync {
    fn create_session(&self, content_type: &str, init_data: Bytes) -> NativeResult<LegacySession>;
}

pub trait LegacyKeySession: Send + Sync {
    fn session_id(&self) -> String;

    fn update(&self, key: Bytes) -> NativeResult<()>;

    fn close(&self) -> NativeResult<()>;
}

/// Native legacy session and its event stream
pub struct LegacySession {
    pub handle: Arc<dyn LegacyKeySession>,
    pub events: mpsc::UnboundedReceiver<LegacyKeyEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyKeyEvent {
    KeyMessage {
        message: Bytes,
        destination_url: Option<String>,
    },
    KeyAdded,
    KeyError {
        code: u32,
        system_code: u32,
    },
}

/// How init data is shaped before native session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitDataPacking {
    /// Init data, content id and certificate concatenated
    FairPlay,
    /// Only the PlayReady `pssh` box when present
    PlayReady,
    Raw,
}

impl InitDataPacking {
    fn for_key_system(key_system: &str) -> Self {
        match KeySystemFamily::of(key_system) {
            KeySystemFamily::CertificateBased => InitDataPacking::FairPlay,
            KeySystemFamily::ChallengeDocument => InitDataPacking::PlayReady,
            KeySystemFamily::Generic => InitDataPacking::Raw,
        }
    }
}

/// Build the FairPlay session init data.
///
/// Layout: init data, content id byte length (u32 LE), content id as UTF-16LE,
/// certificate length (u32 LE), certificate.
pub fn concat_init_data(init_data: &[u8], content_id: &str, certificate: &[u8]) -> Bytes {
    let id = encode_utf16_le(content_id);
    let mut buf = BytesMut::with_capacity(init_data.len() + id.len() + certificate.len() + 8);

    buf.put_slice(init_data);
    buf.put_u32_le(id.len() as u32);
    buf.put_slice(&id);
    buf.put_u32_le(certificate.len() as u32);
    buf.put_slice(certificate);

    buf.freeze()
}

/// Key system access on a legacy runtime
pub(crate) struct LegacyAccess {
    key_system: String,
    native_key_system: String,
    runtime: Arc<dyn LegacyRuntime>,
}

impl LegacyAccess {
    pub(crate) fn new(key_system: &str, native_key_system: &str, runtime: Arc<dyn LegacyRuntime>) -> Self {
        Self {
            key_system: key_system.to_string(),
            native_key_system: native_key_system.to_string(),
            runtime,
        }
    }
}

#[async_trait]
impl KeySystemAccess for LegacyAccess {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    async fn create_media_keys(&self) -> NativeResult<Arc<dyn MediaKeys>> {
        let native = self.runtime.create_media_keys(&self.native_key_system)?;
        debug!(key_system = %self.native_key_system, "Legacy media keys created");

        Ok(Arc::new(LegacyKeys {
            runtime: Arc::clone(&self.runtime),
            native,
            packing: InitDataPacking::for_key_system(&self.key_system),
            certificate: Mutex::new(None),
        }))
    }
}

struct LegacyKeys {
    runtime: Arc<dyn LegacyRuntime>,
    native: Arc<dyn LegacyMediaKeys>,
    packing: InitDataPacking,
    certificate: Mutex<Option<Bytes>>,
}

impl LegacyKeys {
    fn certificate(&self) -> Option<Bytes> {
        self.certificate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MediaKeys for LegacyKeys {
    async fn set_server_certificate(&self, certificate: Bytes) -> NativeResult<()> {
        // Legacy runtimes take the certificate with each session's init data
        *self
            .certificate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(certificate);
        Ok(())
    }

    fn create_session(&self) -> NativeResult<NativeSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LegacySessionAdapter {
            keys: Arc::clone(&self.native),
            packing: self.packing,
            certificate: self.certificate(),
            native: OnceLock::new(),
            events: tx,
        };

        Ok(NativeSession {
            handle: Arc::new(handle),
            events: rx,
        })
    }

    async fn attach(&self) -> NativeResult<()> {
        self.runtime.set_media_keys(Arc::clone(&self.native))
    }
}

struct LegacySessionAdapter {
    keys: Arc<dyn LegacyMediaKeys>,
    packing: InitDataPacking,
    certificate: Option<Bytes>,
    native: OnceLock<Arc<dyn LegacyKeySession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl LegacySessionAdapter {
    fn pack(&self, request: &GenerateRequest) -> NativeResult<Bytes> {
        match self.packing {
            InitDataPacking::FairPlay => {
                let certificate = self
                    .certificate
                    .as_ref()
                    .ok_or_else(|| NativeError::invalid_state("no server certificate installed"))?;
                let content_id = request
                    .content_id
                    .as_deref()
                    .ok_or_else(|| NativeError::invalid_state("no content id for init data"))?;
                Ok(concat_init_data(&request.init_data, content_id, certificate))
            }
            InitDataPacking::PlayReady => Ok(find_pssh(&request.init_data, DrmSystem::PlayReady.system_id())
                .map(Bytes::copy_from_slice)
                .unwrap_or_else(|| request.init_data.clone())),
            InitDataPacking::Raw => Ok(request.init_data.clone()),
        }
    }
}

#[async_trait]
impl MediaKeySession for LegacySessionAdapter {
    fn session_id(&self) -> String {
        self.native.get().map(|s| s.session_id()).unwrap_or_default()
    }

    async fn generate_request(&self, request: &GenerateRequest) -> NativeResult<()> {
        if self.native.get().is_some() {
            return Err(NativeError::invalid_state("request already generated"));
        }

        let init_data = self.pack(request)?;
        let LegacySession { handle, mut events } = self.keys.create_session(LEGACY_CONTENT_TYPE, init_data)?;
        if self.native.set(handle).is_err() {
            return Err(NativeError::invalid_state("request already generated"));
        }

        let tx = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mapped = match event {
                    LegacyKeyEvent::KeyMessage { message, destination_url } => {
                        debug!(destination_url = ?destination_url, bytes = message.len(), "Legacy key message");
                        SessionEvent::Message {
                            message_type: MessageType::LicenseRequest,
                            message,
                        }
                    }
                    LegacyKeyEvent::KeyAdded => SessionEvent::KeyAdded,
                    LegacyKeyEvent::KeyError { code, system_code } => {
                        warn!(code, system_code, "Legacy key error");
                        SessionEvent::Error { code, system_code }
                    }
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn update(&self, response: Bytes) -> NativeResult<()> {
        match self.native.get() {
            Some(native) => native.update(response),
            None => Err(NativeError::invalid_state("update before request generation")),
        }
    }

    async fn close(&self) -> NativeResult<()> {
        match self.native.get() {
            Some(native) => native.close(),
            None => Ok(()),
        }
    }
}
