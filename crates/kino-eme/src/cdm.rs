//! Common content decryption module interface
//!
//! The orchestration layer talks to one capability interface. Each native
//! dialect is wrapped by a [`DialectAdapter`] in [`crate::dialect`] that maps
//! its own objects and events onto these traits.

use crate::error::NativeResult;
use crate::types::{Dialect, KeyStatus, KeySystemConfiguration, MessageType};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How encrypted signals of a dialect are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPolicy {
    /// Every signal goes straight to the source context
    Immediate,
    /// The first burst per source is debounced
    Debounced,
    /// At most one key session per source
    SingleSession,
}

/// Entry point of a native dialect
#[async_trait]
pub trait DialectAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy::Immediate
    }

    /// Ask the runtime for access to `key_system` with any of `configurations`
    async fn request_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>>;
}

/// Access granted to one key system
#[async_trait]
pub trait KeySystemAccess: Send + Sync {
    fn key_system(&self) -> &str;

    async fn create_media_keys(&self) -> NativeResult<Arc<dyn MediaKeys>>;
}

/// Shared key container of a source
#[async_trait]
pub trait MediaKeys: Send + Sync {
    async fn set_server_certificate(&self, certificate: Bytes) -> NativeResult<()>;

    fn create_session(&self) -> NativeResult<NativeSession>;

    /// Bind the container to the media element
    async fn attach(&self) -> NativeResult<()>;
}

/// Arguments of a request generation
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub init_data_type: String,
    pub init_data: Bytes,
    /// Content id of certificate-based key systems
    pub content_id: Option<String>,
}

/// A native key session
#[async_trait]
pub trait MediaKeySession: Send + Sync {
    /// Empty until the runtime assigns an id
    fn session_id(&self) -> String;

    async fn generate_request(&self, request: &GenerateRequest) -> NativeResult<()>;

    async fn update(&self, response: Bytes) -> NativeResult<()>;

    async fn close(&self) -> NativeResult<()>;
}

/// Key session handle plus the stream of its events
pub struct NativeSession {
    pub handle: Arc<dyn MediaKeySession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Events raised by a key session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message {
        message_type: MessageType,
        message: Bytes,
    },
    KeyStatusesChange(Vec<(Bytes, KeyStatus)>),
    /// Legacy dialects report a key added instead of key statuses
    KeyAdded,
    /// Legacy native key error
    Error { code: u32, system_code: u32 },
}
