//! WebKit-prefixed and MS-prefixed dialects

mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use common::{next_error, pssh_box, wait_until, FakeLegacy, FakeTransport, PLAYREADY_ID, WIDEVINE_ID};
use kino_eme::content_id::encode_utf16_le;
use kino_eme::dialect::concat_init_data;
use kino_eme::transport::RequestKind;
use kino_eme::{Dialect, EmeOptions, EncryptedSignal, KeySystemOptions, Orchestrator, Platform};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const FAIRPLAY: &str = "com.apple.fps.1_0";
const PLAYREADY: &str = "com.microsoft.playready";
const CERT_URL: &str = "https://fps.example.com/cert";

fn fairplay_options() -> EmeOptions {
    EmeOptions::new().with_key_system(
        FAIRPLAY,
        KeySystemOptions::new()
            .with_certificate_uri(Url::parse(CERT_URL).unwrap())
            .with_url(Url::parse("https://fps.example.com/license").unwrap()),
    )
}

fn skd_signal(asset: &str) -> EncryptedSignal {
    EncryptedSignal::new("skd", encode_utf16_le(&format!("skd://{asset}")))
}

fn webkit(runtime: &FakeLegacy, transport: &Arc<FakeTransport>) -> Orchestrator {
    let platform = Platform::new().with_webkit(Arc::new(runtime.clone()));
    let eme = Orchestrator::with_transport(platform, fairplay_options(), transport.clone());
    assert_eq!(eme.dialect(), Some(Dialect::WebKit));
    eme
}

fn playready_key_message(challenge: &[u8]) -> Bytes {
    let xml = format!(
        "\u{feff}<PlayReadyKeyMessage type=\"LicenseAcquisition\">\
           <LicenseAcquisition Version=\"1\">\
             <Challenge encoding=\"base64encoded\">{}</Challenge>\
             <HttpHeaders>\
               <HttpHeader><name>Content-Type</name><value>text/xml; charset=utf-8</value></HttpHeader>\
               <HttpHeader><name>SOAPAction</name><value>http://schemas.microsoft.com/DRM/2007/03/protocols/AcquireLicense</value></HttpHeader>\
             </HttpHeaders>\
           </LicenseAcquisition>\
         </PlayReadyKeyMessage>",
        STANDARD.encode(challenge)
    );
    Bytes::from(encode_utf16_le(&xml))
}

#[tokio::test(start_paused = true)]
async fn webkit_debounces_first_needkey_burst() {
    let runtime = FakeLegacy::new(&[FAIRPLAY], Bytes::from_static(b"spc"));
    let transport = FakeTransport::new();
    transport.respond(CERT_URL, 200, b"CERT");
    let eme = webkit(&runtime, &transport);

    eme.handle_signal(skd_signal("asset-a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    eme.handle_signal(skd_signal("asset-b")).await.unwrap();

    // Nothing happens inside the window
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(runtime.log(|l| l.sessions.is_empty()));
    assert_eq!(transport.count(RequestKind::Certificate), 0);

    wait_until("debounced session", || runtime.log(|l| l.updates.len() == 1)).await;

    let expected = concat_init_data(
        &encode_utf16_le("skd://asset-b"),
        "asset-b",
        b"CERT",
    );
    runtime.log(|l| {
        assert_eq!(l.media_keys_created, [FAIRPLAY]);
        assert_eq!(l.attached, 1);
        assert_eq!(l.sessions.len(), 1);
        assert_eq!(l.sessions[0].0, "video/mp4");
        assert_eq!(l.sessions[0].1, expected);
    });

    // After the first handled signal, later ones go straight through
    eme.handle_signal(skd_signal("asset-c")).await.unwrap();
    assert_eq!(runtime.log(|l| l.sessions.len()), 2);
    assert_eq!(transport.count(RequestKind::License), 2);
}

#[tokio::test(start_paused = true)]
async fn webkit_window_follows_options() {
    let runtime = FakeLegacy::new(&[FAIRPLAY], Bytes::from_static(b"spc"));
    let transport = FakeTransport::new();
    let platform = Platform::new().with_webkit(Arc::new(runtime.clone()));
    let eme = Orchestrator::with_transport(
        platform,
        fairplay_options().with_first_webkitneedkey_timeout(50),
        transport.clone(),
    );

    eme.handle_signal(skd_signal("asset-a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    wait_until("session after short window", || runtime.log(|l| l.sessions.len() == 1)).await;
}

#[tokio::test]
async fn webkit_rejects_other_key_systems() {
    let runtime = FakeLegacy::new(&[FAIRPLAY], Bytes::from_static(b"spc"));
    let transport = FakeTransport::new();
    let platform = Platform::new().with_webkit(Arc::new(runtime.clone()));
    let eme = Orchestrator::with_transport(platform, EmeOptions::new(), transport);

    let support = eme.detect_supported_cdms().await;
    let supported: Vec<&str> = support.iter().filter(|s| s.supported).map(|s| s.key_system).collect();

    // The bare family name maps to the 1.0 native key system
    assert_eq!(supported, ["com.apple.fps"]);
}

#[tokio::test]
async fn modern_dialect_wins_detection() {
    let runtime = FakeLegacy::new(&[FAIRPLAY], Bytes::new());
    let platform = Platform::new()
        .with_ms(Arc::new(runtime.clone()))
        .with_webkit(Arc::new(runtime.clone()))
        .with_modern(Arc::new(common::FakeCdm::new(&[])));

    let eme = Orchestrator::with_transport(platform, EmeOptions::new(), FakeTransport::new());
    assert_eq!(eme.dialect(), Some(Dialect::Modern));

    let none = Orchestrator::with_transport(Platform::new(), EmeOptions::new(), FakeTransport::new());
    assert_eq!(none.dialect(), None);
    none.handle_signal(skd_signal("ignored")).await.unwrap();
}

fn ms(runtime: &FakeLegacy, transport: &Arc<FakeTransport>) -> Orchestrator {
    let platform = Platform::new().with_ms(Arc::new(runtime.clone()));
    let options = EmeOptions::new()
        .with_eme_header("Content-Type", None)
        .with_key_system(
            PLAYREADY,
            KeySystemOptions::new().with_url(Url::parse("https://pr.example.com/rightsmanager.asmx").unwrap()),
        );
    let eme = Orchestrator::with_transport(platform, options, transport.clone());
    assert_eq!(eme.dialect(), Some(Dialect::Ms));
    eme
}

#[tokio::test]
async fn ms_sends_playready_box_and_challenge() {
    let runtime = FakeLegacy::new(&[PLAYREADY], playready_key_message(b"<soap>challenge</soap>"));
    let transport = FakeTransport::new();
    let eme = ms(&runtime, &transport);

    let widevine = pssh_box(WIDEVINE_ID, b"widevine-data");
    let playready = pssh_box(PLAYREADY_ID, b"playready-data");
    let init_data = [widevine.clone(), playready.clone()].concat();

    eme.handle_signal(EncryptedSignal::new("cenc", init_data)).await.unwrap();

    runtime.log(|l| {
        assert_eq!(l.sessions.len(), 1);
        assert_eq!(l.sessions[0].1.as_ref(), &playready[..]);
        assert_eq!(l.updates, vec![Bytes::from_static(b"license")]);
    });

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body.as_deref(), Some(&b"<soap>challenge</soap>"[..]));
    assert_eq!(
        requests[0].headers.get("SOAPAction").map(String::as_str),
        Some("http://schemas.microsoft.com/DRM/2007/03/protocols/AcquireLicense")
    );
    // Removed by the null-valued global header
    assert!(!requests[0].headers.contains_key("Content-Type"));
}

#[tokio::test]
async fn ms_keeps_a_single_session() {
    let runtime = FakeLegacy::new(&[PLAYREADY], playready_key_message(b"challenge"));
    let transport = FakeTransport::new();
    let eme = ms(&runtime, &transport);

    eme.handle_signal(EncryptedSignal::new("cenc", pssh_box(PLAYREADY_ID, b"one")))
        .await
        .unwrap();
    eme.handle_signal(EncryptedSignal::new("cenc", pssh_box(PLAYREADY_ID, b"two")))
        .await
        .unwrap();

    assert_eq!(runtime.log(|l| l.sessions.len()), 1);
    assert_eq!(eme.session_count().await, 1);
}

#[tokio::test]
async fn ms_init_data_without_playready_box_is_passed_through() {
    let runtime = FakeLegacy::new(&[PLAYREADY], playready_key_message(b"challenge"));
    let transport = FakeTransport::new();
    let eme = ms(&runtime, &transport);

    let raw = pssh_box(WIDEVINE_ID, b"only-widevine");
    eme.handle_signal(EncryptedSignal::new("cenc", raw.clone())).await.unwrap();

    runtime.log(|l| assert_eq!(l.sessions[0].1.as_ref(), &raw[..]));
}

#[tokio::test]
async fn legacy_key_error_reaches_error_sink() {
    let runtime = FakeLegacy::with_key_error(&[PLAYREADY], playready_key_message(b"challenge"), 3, 0x8004_c600);
    let transport = FakeTransport::new();
    let eme = ms(&runtime, &transport);
    let mut events = eme.subscribe();

    eme.handle_signal(EncryptedSignal::new("cenc", pssh_box(PLAYREADY_ID, b"pro")))
        .await
        .unwrap();

    let report = next_error(&mut events).await;
    assert_eq!(report.kind, "EME_KEY_SESSION");
    assert_eq!(
        report.message,
        format!("Unexpected key error from key session with code: 3 and systemCode: {}", 0x8004_c600u32)
    );
}
