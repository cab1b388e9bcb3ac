//! Promise-based key system access dialect

use crate::cdm::{DialectAdapter, KeySystemAccess, SignalPolicy};
use crate::error::{NativeError, NativeResult};
use crate::types::{Dialect, KeySystemConfiguration};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Host binding of `navigator.requestMediaKeySystemAccess`.
///
/// The objects it returns already follow the [`crate::cdm`] shape.
#[async_trait]
pub trait ModernRuntime: Send + Sync {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>>;
}

pub struct ModernAdapter {
    runtime: Arc<dyn ModernRuntime>,
}

impl ModernAdapter {
    pub fn new(runtime: Arc<dyn ModernRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl DialectAdapter for ModernAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Modern
    }

    fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy::Immediate
    }

    async fn request_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>> {
        if configurations.is_empty() {
            return Err(NativeError::new(
                "TypeError",
                format!("no configurations supplied for {key_system}"),
            ));
        }

        debug!(key_system, configurations = configurations.len(), "requestMediaKeySystemAccess");
        self.runtime
            .request_media_key_system_access(key_system, configurations)
            .await
    }
}
