//! Key broker configuration
//!
//! [`EmeOptions`] deserializes from the JSON shape players already use:
//!
//! ```json
//! {
//!   "keySystems": {
//!     "com.widevine.alpha": "https://license.example.com/wv",
//!     "com.apple.fps.1_0": {
//!       "certificateUri": "https://fps.example.com/cert",
//!       "licenseUri": "https://fps.example.com/license"
//!     }
//!   },
//!   "emeHeaders": { "X-Custom": "value" }
//! }
//! ```
//!
//! Key system order is preserved; it is the negotiation priority. Custom
//! license, certificate and content id functions are attached in code.

use crate::content_id::{ContentIdProvider, UriHostContentId};
use crate::error::{Error, Result};
use crate::license::{CertificateProvider, HttpCertificate, HttpLicense, LicenseProvider};
use crate::transport::{Headers, Transport};
use crate::types::{KeySystemConfiguration, KeySystemFamily};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default debounce window for the first `webkitneedkey` burst
pub const DEFAULT_FIRST_WEBKITNEEDKEY_TIMEOUT_MS: u64 = 1000;

/// Default number of consecutive renewals without a usable key
pub const DEFAULT_MAX_SESSION_RENEWALS: u32 = 3;

/// Programmatic function attached to a key system
pub struct Hook<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Hook(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> fmt::Debug for Hook<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

/// Global key broker options
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmeOptions {
    /// Key systems in negotiation priority order
    pub key_systems: KeySystems,
    /// Headers added to every certificate and license request
    pub eme_headers: Headers,
    /// Debounce window for the first `webkitneedkey` burst (ms)
    pub first_webkitneedkey_timeout: u64,
    /// Consecutive expiry renewals allowed without a usable key
    pub max_session_renewals: u32,
    /// Base delay before a renewal, doubled on each consecutive renewal (ms)
    pub renewal_backoff: u64,
}

impl Default for EmeOptions {
    fn default() -> Self {
        Self {
            key_systems: KeySystems::default(),
            eme_headers: Headers::new(),
            first_webkitneedkey_timeout: DEFAULT_FIRST_WEBKITNEEDKEY_TIMEOUT_MS,
            max_session_renewals: DEFAULT_MAX_SESSION_RENEWALS,
            renewal_backoff: 0,
        }
    }
}

impl EmeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::configuration("options", e.to_string()))
    }

    pub fn with_key_system(mut self, key_system: impl Into<String>, options: KeySystemOptions) -> Self {
        self.key_systems.insert(key_system, options);
        self
    }

    pub fn with_eme_header(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.eme_headers.insert(name.into(), value.map(str::to_string));
        self
    }

    pub fn with_first_webkitneedkey_timeout(mut self, millis: u64) -> Self {
        self.first_webkitneedkey_timeout = millis;
        self
    }

    pub fn with_max_session_renewals(mut self, renewals: u32) -> Self {
        self.max_session_renewals = renewals;
        self
    }

    pub fn with_renewal_backoff(mut self, millis: u64) -> Self {
        self.renewal_backoff = millis;
        self
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.first_webkitneedkey_timeout)
    }

    /// Delay before the `attempt`th consecutive renewal (1-based)
    pub fn renewal_delay(&self, attempt: u32) -> Duration {
        if self.renewal_backoff == 0 || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.renewal_backoff.saturating_mul(factor))
    }

    /// Options for one source: its key systems merged field-wise over ours
    pub fn for_source(&self, source: &SourceDescriptor) -> EmeOptions {
        let mut merged = self.clone();
        for (name, options) in source.key_systems.iter() {
            let combined = match self.key_systems.get(name) {
                Some(global) => options.clone().merged_over(global),
                None => options.clone(),
            };
            merged.key_systems.insert(name.clone(), combined);
        }
        merged
    }

    /// Normalize one configured key system, usually the negotiated one.
    ///
    /// Other entries are never resolved, so an incomplete fallback does not
    /// block a usable key system.
    pub fn normalize_key_system(
        &self,
        key_system: &str,
        transport: &Arc<dyn Transport>,
    ) -> Result<NormalizedKeySystemOptions> {
        let options = self
            .key_systems
            .get(key_system)
            .ok_or_else(|| Error::configuration(key_system, "key system is not configured"))?;
        normalize(key_system, options, &self.eme_headers, Arc::clone(transport))
    }
}

/// Ordered mapping of key system name to options
#[derive(Debug, Clone, Default)]
pub struct KeySystems(Vec<(String, KeySystemOptions)>);

impl KeySystems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the position of an existing entry
    pub fn insert(&mut self, key_system: impl Into<String>, options: KeySystemOptions) {
        let key_system = key_system.into();
        match self.0.iter_mut().find(|(name, _)| *name == key_system) {
            Some(entry) => entry.1 = options,
            None => self.0.push((key_system, options)),
        }
    }

    pub fn get(&self, key_system: &str) -> Option<&KeySystemOptions> {
        self.0.iter().find(|(name, _)| name == key_system).map(|(_, o)| o)
    }

    pub fn get_mut(&mut self, key_system: &str) -> Option<&mut KeySystemOptions> {
        self.0.iter_mut().find(|(name, _)| name == key_system).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeySystemOptions)> {
        self.0.iter().map(|(name, options)| (name, options))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, KeySystemOptions)> for KeySystems {
    fn from_iter<I: IntoIterator<Item = (K, KeySystemOptions)>>(iter: I) -> Self {
        let mut systems = KeySystems::new();
        for (name, options) in iter {
            systems.insert(name, options);
        }
        systems
    }
}

/// Accepted shapes of a `keySystems` value
#[derive(Deserialize)]
#[serde(untagged)]
enum KeySystemSpec {
    Enabled(bool),
    Url(Url),
    Options(Box<KeySystemOptions>),
}

impl<'de> Deserialize<'de> for KeySystems {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeySystemsVisitor;

        impl<'de> Visitor<'de> for KeySystemsVisitor {
            type Value = KeySystems;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of key system names to a license URL, a boolean or an options object")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<KeySystems, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut systems = KeySystems::new();
                while let Some((name, spec)) = map.next_entry::<String, KeySystemSpec>()? {
                    match spec {
                        KeySystemSpec::Enabled(false) => {}
                        KeySystemSpec::Enabled(true) => systems.insert(name, KeySystemOptions::default()),
                        KeySystemSpec::Url(url) => systems.insert(name, KeySystemOptions::new().with_url(url)),
                        KeySystemSpec::Options(options) => systems.insert(name, *options),
                    }
                }
                Ok(systems)
            }
        }

        deserializer.deserialize_map(KeySystemsVisitor)
    }
}

fn deserialize_base64<'de, D>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    encoded
        .map(|s| STANDARD.decode(s.trim()).map(Bytes::from).map_err(de::Error::custom))
        .transpose()
}

/// Options for one key system
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeySystemOptions {
    /// License server URL
    pub url: Option<Url>,
    /// License server URL; takes precedence over `url`
    pub license_uri: Option<Url>,
    /// Server certificate URL
    pub certificate_uri: Option<Url>,
    pub license_headers: Headers,
    pub certificate_headers: Headers,
    /// Explicit negotiation candidates, replacing the shorthand fields
    pub supported_configurations: Option<Vec<KeySystemConfiguration>>,
    pub audio_content_type: Option<String>,
    pub audio_robustness: Option<String>,
    pub video_content_type: Option<String>,
    pub video_robustness: Option<String>,
    pub persistent_state: Option<String>,
    pub init_data_types: Option<Vec<String>>,
    /// Init data used instead of the one carried by the encrypted signal
    #[serde(deserialize_with = "deserialize_base64")]
    pub pssh: Option<Bytes>,

    #[serde(skip)]
    pub get_license: Option<Hook<dyn LicenseProvider>>,
    #[serde(skip)]
    pub get_certificate: Option<Hook<dyn CertificateProvider>>,
    #[serde(skip)]
    pub get_content_id: Option<Hook<dyn ContentIdProvider>>,
}

impl KeySystemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_certificate_uri(mut self, url: Url) -> Self {
        self.certificate_uri = Some(url);
        self
    }

    pub fn with_license_header(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.license_headers.insert(name.into(), value.map(str::to_string));
        self
    }

    pub fn with_certificate_header(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.certificate_headers.insert(name.into(), value.map(str::to_string));
        self
    }

    pub fn with_supported_configurations(mut self, configurations: Vec<KeySystemConfiguration>) -> Self {
        self.supported_configurations = Some(configurations);
        self
    }

    pub fn with_video_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.video_content_type = Some(content_type.into());
        self
    }

    pub fn with_audio_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.audio_content_type = Some(content_type.into());
        self
    }

    pub fn with_init_data_types(mut self, types: Vec<String>) -> Self {
        self.init_data_types = Some(types);
        self
    }

    pub fn with_pssh(mut self, pssh: impl Into<Bytes>) -> Self {
        self.pssh = Some(pssh.into());
        self
    }

    pub fn with_license(mut self, provider: impl LicenseProvider + 'static) -> Self {
        self.get_license = Some(Hook(Arc::new(provider)));
        self
    }

    /// Legacy name for [`with_license`](Self::with_license)
    pub fn with_key(self, provider: impl LicenseProvider + 'static) -> Self {
        self.with_license(provider)
    }

    pub fn with_certificate(mut self, provider: impl CertificateProvider + 'static) -> Self {
        self.get_certificate = Some(Hook(Arc::new(provider)));
        self
    }

    pub fn with_content_id(mut self, provider: impl ContentIdProvider + 'static) -> Self {
        self.get_content_id = Some(Hook(Arc::new(provider)));
        self
    }

    /// License endpoint, `licenseUri` winning over `url`
    pub fn license_url(&self) -> Option<&Url> {
        self.license_uri.as_ref().or(self.url.as_ref())
    }

    /// Overlay `self` on `base`; set fields and headers of `self` win
    pub fn merged_over(self, base: &KeySystemOptions) -> KeySystemOptions {
        let mut license_headers = base.license_headers.clone();
        license_headers.extend(self.license_headers);
        let mut certificate_headers = base.certificate_headers.clone();
        certificate_headers.extend(self.certificate_headers);

        KeySystemOptions {
            url: self.url.or_else(|| base.url.clone()),
            license_uri: self.license_uri.or_else(|| base.license_uri.clone()),
            certificate_uri: self.certificate_uri.or_else(|| base.certificate_uri.clone()),
            license_headers,
            certificate_headers,
            supported_configurations: self
                .supported_configurations
                .or_else(|| base.supported_configurations.clone()),
            audio_content_type: self.audio_content_type.or_else(|| base.audio_content_type.clone()),
            audio_robustness: self.audio_robustness.or_else(|| base.audio_robustness.clone()),
            video_content_type: self.video_content_type.or_else(|| base.video_content_type.clone()),
            video_robustness: self.video_robustness.or_else(|| base.video_robustness.clone()),
            persistent_state: self.persistent_state.or_else(|| base.persistent_state.clone()),
            init_data_types: self.init_data_types.or_else(|| base.init_data_types.clone()),
            pssh: self.pssh.or_else(|| base.pssh.clone()),
            get_license: self.get_license.or_else(|| base.get_license.clone()),
            get_certificate: self.get_certificate.or_else(|| base.get_certificate.clone()),
            get_content_id: self.get_content_id.or_else(|| base.get_content_id.clone()),
        }
    }
}

/// A media source and the key systems it brings along
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceDescriptor {
    /// Source URI or any id unique per loaded source
    pub src: String,
    pub key_systems: KeySystems,
}

impl SourceDescriptor {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            key_systems: KeySystems::new(),
        }
    }

    pub fn with_key_system(mut self, key_system: impl Into<String>, options: KeySystemOptions) -> Self {
        self.key_systems.insert(key_system, options);
        self
    }
}

/// Resolved providers for one key system, fixed for a provisioning sequence
#[derive(Clone)]
pub struct NormalizedKeySystemOptions {
    pub key_system: String,
    pub family: KeySystemFamily,
    pub license: Arc<dyn LicenseProvider>,
    pub certificate: Option<Arc<dyn CertificateProvider>>,
    pub content_id: Option<Arc<dyn ContentIdProvider>>,
    pub pssh: Option<Bytes>,
}

impl fmt::Debug for NormalizedKeySystemOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedKeySystemOptions")
            .field("key_system", &self.key_system)
            .field("family", &self.family)
            .field("certificate", &self.certificate.is_some())
            .field("content_id", &self.content_id.is_some())
            .field("pssh", &self.pssh.as_ref().map(|p| p.len()))
            .finish()
    }
}

/// Resolve the providers of a key system.
///
/// Custom functions win over endpoints. A license source is always required;
/// the FairPlay family also requires a certificate source and gets the URI
/// host content id unless one is supplied.
pub fn normalize(
    key_system: &str,
    options: &KeySystemOptions,
    eme_headers: &Headers,
    transport: Arc<dyn Transport>,
) -> Result<NormalizedKeySystemOptions> {
    let family = KeySystemFamily::of(key_system);

    let license: Arc<dyn LicenseProvider> = match (&options.get_license, options.license_url()) {
        (Some(hook), _) => Arc::clone(&hook.0),
        (None, Some(url)) => Arc::new(HttpLicense::new(
            key_system,
            url.clone(),
            eme_headers.clone(),
            options.license_headers.clone(),
            Arc::clone(&transport),
        )),
        (None, None) => {
            return Err(Error::configuration(
                key_system,
                "a license url or a getLicense function is required",
            ))
        }
    };

    let certificate: Option<Arc<dyn CertificateProvider>> = match (&options.get_certificate, &options.certificate_uri) {
        (Some(hook), _) => Some(Arc::clone(&hook.0)),
        (None, Some(url)) => Some(Arc::new(HttpCertificate::new(
            url.clone(),
            eme_headers.clone(),
            options.certificate_headers.clone(),
            Arc::clone(&transport),
        ))),
        (None, None) => None,
    };

    if family == KeySystemFamily::CertificateBased && certificate.is_none() {
        return Err(Error::configuration(
            key_system,
            "a certificateUri or a getCertificate function is required",
        ));
    }

    let content_id: Option<Arc<dyn ContentIdProvider>> = match &options.get_content_id {
        Some(hook) => Some(Arc::clone(&hook.0)),
        None if family == KeySystemFamily::CertificateBased => Some(Arc::new(UriHostContentId)),
        None => None,
    };

    Ok(NormalizedKeySystemOptions {
        key_system: key_system.to_string(),
        family,
        license,
        certificate,
        content_id,
        pssh: options.pssh.clone(),
    })
}
