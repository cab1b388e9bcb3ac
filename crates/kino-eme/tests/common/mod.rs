//! Fake native runtimes and transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kino_eme::cdm::{GenerateRequest, KeySystemAccess, MediaKeySession, MediaKeys, NativeSession, SessionEvent};
use kino_eme::dialect::{LegacyKeyEvent, LegacyKeySession, LegacyMediaKeys, LegacyRuntime, LegacySession, ModernRuntime};
use kino_eme::events::{EmeEvent, EventRecord};
use kino_eme::transport::{HttpRequest, HttpResponse, RequestKind, Transport};
use kino_eme::{ErrorReport, KeyStatus, KeySystemConfiguration, NativeError, NativeResult, Result};
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WIDEVINE_ID: [u8; 16] = [
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21, 0xed,
];
pub const PLAYREADY_ID: [u8; 16] = [
    0x9a, 0x04, 0xf0, 0x79, 0x98, 0x40, 0x42, 0x86, 0xab, 0x92, 0xe6, 0x5b, 0xe0, 0x88, 0x5f, 0x95,
];

/// Version 0 `pssh` box
pub fn pssh_box(system_id: [u8; 16], data: &[u8]) -> Vec<u8> {
    let size = (32 + data.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&system_id);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Next error report delivered to the sink
pub async fn next_error(rx: &mut broadcast::Receiver<EventRecord>) -> ErrorReport {
    next_event(rx, |event| match event {
        EmeEvent::Error(report) => Some(report.clone()),
        _ => None,
    })
    .await
}

pub async fn next_event<T>(rx: &mut broadcast::Receiver<EventRecord>, pick: impl Fn(&EmeEvent) -> Option<T>) -> T {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = rx.recv().await.expect("event bus closed");
            if let Some(found) = pick(&record.event) {
                return found;
            }
        }
    })
    .await;
    found.expect("timed out waiting for event")
}

// ---------------------------------------------------------------------------
// Modern runtime

#[derive(Default)]
pub struct CdmLog {
    pub access_requests: Vec<(String, Vec<KeySystemConfiguration>)>,
    pub media_keys_created: usize,
    pub certificates: Vec<Bytes>,
    pub attached: usize,
    pub sessions: usize,
    pub generated: Vec<GenerateRequest>,
    pub updates: Vec<Bytes>,
    pub closed: Vec<String>,
}

pub struct CdmInner {
    supported: Vec<String>,
    access_delay: Duration,
    statuses: Mutex<VecDeque<KeyStatus>>,
    default_status: KeyStatus,
    attach_fails: bool,
    log: Mutex<CdmLog>,
}

/// Scriptable stand-in for `requestMediaKeySystemAccess`
#[derive(Clone)]
pub struct FakeCdm(Arc<CdmInner>);

impl Deref for FakeCdm {
    type Target = CdmInner;

    fn deref(&self) -> &CdmInner {
        &self.0
    }
}

impl FakeCdm {
    pub fn new(supported: &[&str]) -> Self {
        Self::build(supported, Duration::ZERO, Vec::new(), KeyStatus::Usable, false)
    }

    /// Binding the key container to the element fails
    pub fn with_failing_attach(supported: &[&str]) -> Self {
        Self::build(supported, Duration::ZERO, Vec::new(), KeyStatus::Usable, true)
    }

    /// Access requests resolve after `delay`, leaving time for signals to queue
    pub fn with_delay(supported: &[&str], delay: Duration) -> Self {
        Self::build(supported, delay, Vec::new(), KeyStatus::Usable, false)
    }

    /// Each license update reports the next scripted status, then `default_status`
    pub fn with_statuses(supported: &[&str], script: Vec<KeyStatus>, default_status: KeyStatus) -> Self {
        Self::build(supported, Duration::ZERO, script, default_status, false)
    }

    fn build(
        supported: &[&str],
        access_delay: Duration,
        script: Vec<KeyStatus>,
        default_status: KeyStatus,
        attach_fails: bool,
    ) -> Self {
        FakeCdm(Arc::new(CdmInner {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            access_delay,
            statuses: Mutex::new(script.into()),
            default_status,
            attach_fails,
            log: Mutex::new(CdmLog::default()),
        }))
    }

    pub fn log<T>(&self, read: impl FnOnce(&CdmLog) -> T) -> T {
        read(&self.log.lock().unwrap())
    }

    fn next_status(&self) -> KeyStatus {
        self.statuses.lock().unwrap().pop_front().unwrap_or(self.default_status)
    }
}

#[async_trait]
impl ModernRuntime for FakeCdm {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> NativeResult<Arc<dyn KeySystemAccess>> {
        self.log
            .lock()
            .unwrap()
            .access_requests
            .push((key_system.to_string(), configurations.to_vec()));

        if !self.access_delay.is_zero() {
            tokio::time::sleep(self.access_delay).await;
        }

        if !self.supported.iter().any(|s| s == key_system) {
            return Err(NativeError::not_supported(format!("unsupported key system {key_system}")));
        }
        Ok(Arc::new(FakeAccess {
            key_system: key_system.to_string(),
            cdm: self.clone(),
        }))
    }
}

struct FakeAccess {
    key_system: String,
    cdm: FakeCdm,
}

#[async_trait]
impl KeySystemAccess for FakeAccess {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    async fn create_media_keys(&self) -> NativeResult<Arc<dyn MediaKeys>> {
        self.cdm.log.lock().unwrap().media_keys_created += 1;
        Ok(Arc::new(FakeMediaKeys { cdm: self.cdm.clone() }))
    }
}

struct FakeMediaKeys {
    cdm: FakeCdm,
}

#[async_trait]
impl MediaKeys for FakeMediaKeys {
    async fn set_server_certificate(&self, certificate: Bytes) -> NativeResult<()> {
        self.cdm.log.lock().unwrap().certificates.push(certificate);
        Ok(())
    }

    fn create_session(&self) -> NativeResult<NativeSession> {
        let mut log = self.cdm.log.lock().unwrap();
        log.sessions += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let session = FakeSession {
            id: format!("session-{}", log.sessions),
            cdm: self.cdm.clone(),
            tx,
        };
        Ok(NativeSession {
            handle: Arc::new(session),
            events: rx,
        })
    }

    async fn attach(&self) -> NativeResult<()> {
        if self.cdm.attach_fails {
            return Err(NativeError::invalid_state("media element rejected the key container"));
        }
        self.cdm.log.lock().unwrap().attached += 1;
        Ok(())
    }
}

struct FakeSession {
    id: String,
    cdm: FakeCdm,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

#[async_trait]
impl MediaKeySession for FakeSession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn generate_request(&self, request: &GenerateRequest) -> NativeResult<()> {
        self.cdm.log.lock().unwrap().generated.push(request.clone());
        let _ = self.tx.send(SessionEvent::Message {
            message_type: kino_eme::MessageType::LicenseRequest,
            message: request.init_data.clone(),
        });
        Ok(())
    }

    async fn update(&self, response: Bytes) -> NativeResult<()> {
        self.cdm.log.lock().unwrap().updates.push(response);
        let status = self.cdm.next_status();
        let _ = self
            .tx
            .send(SessionEvent::KeyStatusesChange(vec![(Bytes::from_static(&[0x01, 0x02]), status)]));
        Ok(())
    }

    async fn close(&self) -> NativeResult<()> {
        self.cdm.log.lock().unwrap().closed.push(self.id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Legacy runtime

#[derive(Default)]
pub struct LegacyLog {
    pub media_keys_created: Vec<String>,
    pub attached: usize,
    pub sessions: Vec<(String, Bytes)>,
    pub updates: Vec<Bytes>,
    pub closed: usize,
}

pub struct LegacyInner {
    supported: Vec<String>,
    key_message: Bytes,
    key_error: Option<(u32, u32)>,
    log: Mutex<LegacyLog>,
    next_id: AtomicUsize,
}

/// Stand-in for `WebKitMediaKeys` or `MSMediaKeys`
#[derive(Clone)]
pub struct FakeLegacy(Arc<LegacyInner>);

impl Deref for FakeLegacy {
    type Target = LegacyInner;

    fn deref(&self) -> &LegacyInner {
        &self.0
    }
}

impl FakeLegacy {
    pub fn new(supported: &[&str], key_message: impl Into<Bytes>) -> Self {
        Self::build(supported, key_message.into(), None)
    }

    /// Sessions raise a key error instead of key added after an update
    pub fn with_key_error(supported: &[&str], key_message: impl Into<Bytes>, code: u32, system_code: u32) -> Self {
        Self::build(supported, key_message.into(), Some((code, system_code)))
    }

    fn build(supported: &[&str], key_message: Bytes, key_error: Option<(u32, u32)>) -> Self {
        FakeLegacy(Arc::new(LegacyInner {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            key_message,
            key_error,
            log: Mutex::new(LegacyLog::default()),
            next_id: AtomicUsize::new(0),
        }))
    }

    pub fn log<T>(&self, read: impl FnOnce(&LegacyLog) -> T) -> T {
        read(&self.log.lock().unwrap())
    }
}

impl LegacyRuntime for FakeLegacy {
    fn is_type_supported(&self, key_system: &str, content_type: &str) -> bool {
        content_type == "video/mp4" && self.supported.iter().any(|s| s == key_system)
    }

    fn create_media_keys(&self, key_system: &str) -> NativeResult<Arc<dyn LegacyMediaKeys>> {
        self.log.lock().unwrap().media_keys_created.push(key_system.to_string());
        Ok(Arc::new(self.clone()))
    }

    fn set_media_keys(&self, _keys: Arc<dyn LegacyMediaKeys>) -> NativeResult<()> {
        self.log.lock().unwrap().attached += 1;
        Ok(())
    }
}

impl LegacyMediaKeys for FakeLegacy {
    fn create_session(&self, content_type: &str, init_data: Bytes) -> NativeResult<LegacySession> {
        self.log
            .lock()
            .unwrap()
            .sessions
            .push((content_type.to_string(), init_data));

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(LegacyKeyEvent::KeyMessage {
            message: self.key_message.clone(),
            destination_url: Some("https://legacy.example.com/license".into()),
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LegacySession {
            handle: Arc::new(FakeLegacySession {
                id: format!("legacy-{id}"),
                runtime: self.clone(),
                tx,
            }),
            events: rx,
        })
    }
}

struct FakeLegacySession {
    id: String,
    runtime: FakeLegacy,
    tx: mpsc::UnboundedSender<LegacyKeyEvent>,
}

impl LegacyKeySession for FakeLegacySession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    fn update(&self, key: Bytes) -> NativeResult<()> {
        self.runtime.log.lock().unwrap().updates.push(key);
        let event = match self.runtime.key_error {
            Some((code, system_code)) => LegacyKeyEvent::KeyError { code, system_code },
            None => LegacyKeyEvent::KeyAdded,
        };
        let _ = self.tx.send(event);
        Ok(())
    }

    fn close(&self) -> NativeResult<()> {
        self.runtime.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport

/// Records requests and answers from a per-URL table, `200 license` by default
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, status: u16, body: &'static [u8]) {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            HttpResponse {
                status,
                body: Bytes::from_static(body),
            },
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.kind == kind).count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| HttpResponse::ok(Bytes::from_static(b"license")));
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }
}
