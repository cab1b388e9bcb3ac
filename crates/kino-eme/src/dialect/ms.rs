//! `MSMediaKeys` dialect (legacy PlayReady)

use super::legacy::{LegacyAccess, LegacyRuntime};
use crate::cdm::{DialectAdapter, KeySystemAccess, SignalPolicy};
use crate::error::{NativeError, NativeResult};
use crate::types::{Dialect, KeySystemConfiguration, LEGACY_CONTENT_TYPE, PLAYREADY_KEY_SYSTEM};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct MsAdapter {
    runtime: Arc<dyn LegacyRuntime>,
}

impl MsAdapter {
    pub fn new(runtime: Arc<dyn LegacyRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl DialectAdapter for MsAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Ms
    }

    fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy::SingleSession
    }

    async fn request_access(
        &self,
        key_system: &str,
        _configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>> {
        if key_system != PLAYREADY_KEY_SYSTEM || !self.runtime.is_type_supported(key_system, LEGACY_CONTENT_TYPE) {
            return Err(NativeError::not_supported(format!(
                "{key_system} is not supported by MSMediaKeys"
            )));
        }

        debug!(key_system, "MS key system access granted");
        Ok(Arc::new(LegacyAccess::new(key_system, key_system, Arc::clone(&self.runtime))))
    }
}
