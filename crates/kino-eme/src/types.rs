//! Core types for Kino EME

use serde::{Deserialize, Serialize};

/// Well-known key system prefix for the FairPlay family
pub const FAIRPLAY_PREFIX: &str = "com.apple.fps";

/// Legacy FairPlay key system used by the WebKit-prefixed dialect
pub const LEGACY_FAIRPLAY_KEY_SYSTEM: &str = "com.apple.fps.1_0";

/// PlayReady key system
pub const PLAYREADY_KEY_SYSTEM: &str = "com.microsoft.playready";

/// Content type every legacy dialect creates sessions for
pub const LEGACY_CONTENT_TYPE: &str = "video/mp4";

/// DRM system types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrmSystem {
    Widevine,
    FairPlay,
    PlayReady,
    ClearKey,
}

impl DrmSystem {
    pub const ALL: [DrmSystem; 4] = [
        DrmSystem::Widevine,
        DrmSystem::PlayReady,
        DrmSystem::FairPlay,
        DrmSystem::ClearKey,
    ];

    /// Returns the system ID (UUID) for PSSH box
    pub fn system_id(&self) -> &'static str {
        match self {
            DrmSystem::Widevine => "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed",
            DrmSystem::FairPlay => "94ce86fb-07ff-4f43-adb8-93d2fa968ca2",
            DrmSystem::PlayReady => "9a04f079-9840-4286-ab92-e65be0885f95",
            DrmSystem::ClearKey => "1077efec-c0b2-4d02-ace3-3c1e52e2fb4b",
        }
    }

    /// Returns the EME key system string
    pub fn key_system(&self) -> &'static str {
        match self {
            DrmSystem::Widevine => "com.widevine.alpha",
            DrmSystem::FairPlay => FAIRPLAY_PREFIX,
            DrmSystem::PlayReady => PLAYREADY_KEY_SYSTEM,
            DrmSystem::ClearKey => "org.w3.clearkey",
        }
    }

    /// Map a PSSH system id back to a DRM system
    pub fn from_system_id(system_id: &str) -> Option<Self> {
        let system_id = system_id.to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.system_id() == system_id)
    }
}

impl std::fmt::Display for DrmSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrmSystem::Widevine => write!(f, "widevine"),
            DrmSystem::FairPlay => write!(f, "fairplay"),
            DrmSystem::PlayReady => write!(f, "playready"),
            DrmSystem::ClearKey => write!(f, "clearkey"),
        }
    }
}

/// License protocol family a key system belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySystemFamily {
    /// Raw message POSTed to the license server
    Generic,
    /// Message is a UTF-16 XML challenge document (PlayReady)
    ChallengeDocument,
    /// Requires a server certificate and a content id (FairPlay)
    CertificateBased,
}

impl KeySystemFamily {
    pub fn of(key_system: &str) -> Self {
        if key_system == PLAYREADY_KEY_SYSTEM {
            KeySystemFamily::ChallengeDocument
        } else if is_fairplay(key_system) {
            KeySystemFamily::CertificateBased
        } else {
            KeySystemFamily::Generic
        }
    }
}

/// Returns true for key systems of the FairPlay family
pub fn is_fairplay(key_system: &str) -> bool {
    key_system.starts_with(FAIRPLAY_PREFIX)
}

/// Native content protection dialect exposed by the media element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Promise-based `requestMediaKeySystemAccess` API
    Modern,
    /// `WebKitMediaKeys` with `webkitneedkey` signals
    WebKit,
    /// `MSMediaKeys` with `msneedkey` signals
    Ms,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Modern => write!(f, "modern"),
            Dialect::WebKit => write!(f, "webkit"),
            Dialect::Ms => write!(f, "ms"),
        }
    }
}

/// Type of a key session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

impl MessageType {
    /// Only these messages start a license exchange
    pub fn wants_license(&self) -> bool {
        matches!(self, MessageType::LicenseRequest | MessageType::LicenseRenewal)
    }
}

/// Status of a single key inside a key session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
    UsableInFuture,
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyStatus::Usable => "usable",
            KeyStatus::Expired => "expired",
            KeyStatus::Released => "released",
            KeyStatus::OutputRestricted => "output-restricted",
            KeyStatus::OutputDownscaled => "output-downscaled",
            KeyStatus::StatusPending => "status-pending",
            KeyStatus::InternalError => "internal-error",
            KeyStatus::UsableInFuture => "usable-in-future",
        };
        f.write_str(s)
    }
}

/// Key session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Native session obtained from the key container
    Created,
    /// Request generated, waiting for a license
    AwaitingResponse,
    /// License applied
    Licensed,
    /// Native close in flight
    Closing,
    /// Session closed
    Closed,
}

impl SessionState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Created, AwaitingResponse) | (Created, Closing) |
            (AwaitingResponse, Licensed) | (AwaitingResponse, Closing) |
            // Renewal messages re-apply a license on a licensed session
            (Licensed, Licensed) | (Licensed, Closing) |
            (Closing, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::AwaitingResponse => write!(f, "awaiting_response"),
            SessionState::Licensed => write!(f, "licensed"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Audio or video capability inside a key system configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robustness: Option<String>,
}

/// Capability descriptor handed to the native runtime during negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySystemConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_data_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_capabilities: Vec<MediaCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_capabilities: Vec<MediaCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinctive_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_types: Vec<String>,
}
