//! Native dialect adapters
//!
//! Detection prefers the modern API, then `WebKitMediaKeys`, then
//! `MSMediaKeys`. The adapter is selected once per orchestrator.

pub mod legacy;
pub mod modern;
pub mod ms;
pub mod webkit;

pub use legacy::{concat_init_data, LegacyKeyEvent, LegacyKeySession, LegacyMediaKeys, LegacyRuntime, LegacySession};
pub use modern::{ModernAdapter, ModernRuntime};
pub use ms::MsAdapter;
pub use webkit::WebKitAdapter;

use crate::cdm::DialectAdapter;
use std::sync::Arc;

/// Native APIs present on the host
#[derive(Clone, Default)]
pub struct Platform {
    pub modern: Option<Arc<dyn ModernRuntime>>,
    pub webkit: Option<Arc<dyn LegacyRuntime>>,
    pub ms: Option<Arc<dyn LegacyRuntime>>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_modern(mut self, runtime: Arc<dyn ModernRuntime>) -> Self {
        self.modern = Some(runtime);
        self
    }

    pub fn with_webkit(mut self, runtime: Arc<dyn LegacyRuntime>) -> Self {
        self.webkit = Some(runtime);
        self
    }

    pub fn with_ms(mut self, runtime: Arc<dyn LegacyRuntime>) -> Self {
        self.ms = Some(runtime);
        self
    }

    /// Adapter for the preferred dialect, if any is available
    pub fn select(&self) -> Option<Arc<dyn DialectAdapter>> {
        if let Some(runtime) = &self.modern {
            return Some(Arc::new(ModernAdapter::new(Arc::clone(runtime))));
        }
        if let Some(runtime) = &self.webkit {
            return Some(Arc::new(WebKitAdapter::new(Arc::clone(runtime))));
        }
        self.ms
            .as_ref()
            .map(|runtime| Arc::new(MsAdapter::new(Arc::clone(runtime))) as Arc<dyn DialectAdapter>)
    }
}
