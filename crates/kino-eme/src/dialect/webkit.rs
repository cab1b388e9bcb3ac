//! `WebKitMediaKeys` dialect (legacy FairPlay)

use super::legacy::{LegacyAccess, LegacyRuntime};
use crate::cdm::{DialectAdapter, KeySystemAccess, SignalPolicy};
use crate::error::{NativeError, NativeResult};
use crate::types::{is_fairplay, Dialect, KeySystemConfiguration, FAIRPLAY_PREFIX, LEGACY_CONTENT_TYPE, LEGACY_FAIRPLAY_KEY_SYSTEM};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct WebKitAdapter {
    runtime: Arc<dyn LegacyRuntime>,
}

impl WebKitAdapter {
    pub fn new(runtime: Arc<dyn LegacyRuntime>) -> Self {
        Self { runtime }
    }
}

/// Name handed to `WebKitMediaKeys`; the bare family name maps to version 1.0
fn native_key_system(key_system: &str) -> &str {
    if key_system == FAIRPLAY_PREFIX {
        LEGACY_FAIRPLAY_KEY_SYSTEM
    } else {
        key_system
    }
}

#[async_trait]
impl DialectAdapter for WebKitAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::WebKit
    }

    fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy::Debounced
    }

    async fn request_access(
        &self,
        key_system: &str,
        _configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>> {
        if !is_fairplay(key_system) {
            return Err(NativeError::not_supported(format!(
                "{key_system} is not supported by WebKitMediaKeys"
            )));
        }

        let native = native_key_system(key_system);
        if !self.runtime.is_type_supported(native, LEGACY_CONTENT_TYPE) {
            return Err(NativeError::not_supported(format!(
                "WebKitMediaKeys does not support {native} with {LEGACY_CONTENT_TYPE}"
            )));
        }

        debug!(key_system, native, "WebKit key system access granted");
        Ok(Arc::new(LegacyAccess::new(key_system, native, Arc::clone(&self.runtime))))
    }
}
