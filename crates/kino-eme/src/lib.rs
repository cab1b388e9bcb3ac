//! Kino EME - Encrypted Media Key Broker for Kino
//!
//! This crate brokers decryption keys between a media element and license
//! servers:
//! - Native dialect detection (modern, WebKit-prefixed, MS-prefixed)
//! - Key system negotiation
//! - Key container provisioning with certificate installation
//! - Per-content key session deduplication
//! - License exchange and expiry renewal
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Kino EME                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   encrypted signal ──▶ ┌──────────────┐                         │
//! │                        │ Orchestrator │── dialect adapter       │
//! │                        └──────┬───────┘                         │
//! │                               │                                 │
//! │                        ┌──────┴───────┐                         │
//! │                        │SourceContext │                         │
//! │                        └──────┬───────┘                         │
//! │          ┌────────────────────┼────────────────────┐            │
//! │  ┌───────┴──────┐   ┌─────────┴──────┐   ┌─────────┴──────┐     │
//! │  │ Provisioning │   │    Session     │   │  Key Session   │     │
//! │  │   Barrier    │   │    Registry    │   │   Lifecycle    │     │
//! │  └───────┬──────┘   └────────────────┘   └─────────┬──────┘     │
//! │          │                                         │            │
//! │  ┌───────┴──────┐                        ┌─────────┴──────┐     │
//! │  │  Negotiator  │                        │    License     │     │
//! │  └──────────────┘                        │   Transport    │     │
//! │                                          └────────────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod pssh;
pub mod content_id;
pub mod transport;
pub mod events;
pub mod license;
pub mod config;
pub mod cdm;
pub mod dialect;
pub mod negotiate;
pub mod registry;
pub mod provisioning;
pub mod context;
mod lifecycle;
pub mod orchestrator;

pub use error::{Error, ErrorReport, NativeError, NativeResult, Result};
pub use types::*;
pub use pssh::{find_pssh, parse_pssh_boxes, PsshBox};
pub use content_id::{ContentIdProvider, UriHostContentId};
pub use transport::{merge_headers, Headers, HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use events::{EmeEvent, EventBus, EventRecord, KeyStatusEntry};
pub use license::{CertificateProvider, ChallengeDocument, HttpCertificate, HttpLicense, LicenseMessage, LicenseProvider};
pub use config::{EmeOptions, KeySystemOptions, KeySystems, NormalizedKeySystemOptions, SourceDescriptor};
pub use cdm::{DialectAdapter, KeySystemAccess, MediaKeySession, MediaKeys, NativeSession, SessionEvent};
pub use dialect::Platform;
pub use negotiate::KeySystemNegotiator;
pub use registry::SessionRegistry;
pub use provisioning::{ProvisioningBarrier, ProvisioningPhase};
pub use context::{SessionRequest, SourceContext};
pub use orchestrator::{CdmSupport, EncryptedSignal, Orchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the key broker library
pub fn init() {
    tracing::info!(version = VERSION, "Kino EME initialized");
}
