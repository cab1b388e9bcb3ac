//! Key system negotiation
//!
//! Key systems are tried in configuration order; the first one the native
//! runtime grants wins.

use crate::cdm::{DialectAdapter, KeySystemAccess};
use crate::config::{KeySystemOptions, KeySystems};
use crate::error::{Error, Result};
use crate::types::{is_fairplay, KeySystemConfiguration, MediaCapability};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const FAIRPLAY_INIT_DATA_TYPE: &str = "sinf";
const FAIRPLAY_VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// Configuration candidates for one key system.
///
/// An explicit `supportedConfigurations` list is used as is. Otherwise one
/// configuration is built from the shorthand fields.
pub fn candidate_configurations(key_system: &str, options: &KeySystemOptions) -> Vec<KeySystemConfiguration> {
    if let Some(explicit) = &options.supported_configurations {
        return explicit.clone();
    }

    let fairplay = is_fairplay(key_system);
    let mut config = KeySystemConfiguration::default();

    config.init_data_types = match &options.init_data_types {
        Some(types) => types.clone(),
        None if fairplay => vec![FAIRPLAY_INIT_DATA_TYPE.to_string()],
        None => Vec::new(),
    };

    if options.audio_content_type.is_some() || options.audio_robustness.is_some() {
        config.audio_capabilities.push(MediaCapability {
            content_type: options.audio_content_type.clone(),
            robustness: options.audio_robustness.clone(),
        });
    }

    let video_content_type = options
        .video_content_type
        .clone()
        .or_else(|| fairplay.then(|| FAIRPLAY_VIDEO_CONTENT_TYPE.to_string()));
    if video_content_type.is_some() || options.video_robustness.is_some() {
        config.video_capabilities.push(MediaCapability {
            content_type: video_content_type,
            robustness: options.video_robustness.clone(),
        });
    }

    config.persistent_state = options.persistent_state.clone();

    vec![config]
}

/// Negotiates a key system with the native runtime
pub struct KeySystemNegotiator {
    adapter: Arc<dyn DialectAdapter>,
}

impl KeySystemNegotiator {
    pub fn new(adapter: Arc<dyn DialectAdapter>) -> Self {
        Self { adapter }
    }

    /// Return access to the first key system the runtime supports
    #[instrument(skip(self, key_systems), fields(dialect = %self.adapter.dialect(), candidates = key_systems.len()))]
    pub async fn negotiate(&self, key_systems: &KeySystems) -> Result<Arc<dyn KeySystemAccess>> {
        let mut last_error = None;

        for (key_system, options) in key_systems.iter() {
            let configurations = candidate_configurations(key_system, options);

            match self.adapter.request_access(key_system, &configurations).await {
                Ok(access) => {
                    info!(key_system = %key_system, "Key system negotiated");
                    return Ok(access);
                }
                Err(e) => {
                    debug!(key_system = %key_system, error = %e, "Key system rejected");
                    last_error = Some(e.message);
                }
            }
        }

        Err(Error::Negotiation(
            last_error.unwrap_or_else(|| "no key systems configured".to_string()),
        ))
    }
}
