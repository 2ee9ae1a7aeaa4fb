//! End-to-end validation behavior through the dispatcher and the HTTP
//! front end, using the software device and a temporary record store.

use async_trait::async_trait;
use otpval_core::clients::ClientTable;
use otpval_core::device::{
    DeviceError, DeviceHandle, DeviceResult, SecretRef, SoftDevice, StoredOtpCounters,
    TrustDevice,
};
use otpval_core::params::{EnabledModes, ParamMap};
use otpval_core::signature;
use otpval_server::dispatcher::Dispatcher;
use otpval_server::http::{self, AppState};
use otpval_store::{OathRecord, OathStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const OATH_KEY: &[u8] = b"12345678901234567890";
const UID: &str = "ubftcdcdckcf";
const CLIENT_SECRET: &[u8] = b"shared secret";
const CLIENTS: &str = "1,c2hhcmVkIHNlY3JldA==\n";

struct Setup {
    dispatcher: Dispatcher,
    store: OathStore,
    _dir: tempfile::TempDir,
}

/// Dispatcher with all modes enabled, one enrolled OATH identity at
/// counter 0, one registered event-OTP key, and one known client id.
async fn setup() -> Setup {
    let device = SoftDevice::new();
    let secret = device.load_secret(8192, OATH_KEY);
    device.import_yubikey(
        "cccccccccccb",
        StoredOtpCounters {
            use_counter: 3,
            session_counter: 0,
            ts_high: 1,
            ts_low: 0x1234,
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let store = OathStore::open(&dir.path().join("val.db")).await.unwrap();
    store
        .add(&OathRecord {
            identity: UID.to_string(),
            secret,
            counter: 0,
        })
        .await
        .unwrap();

    let dispatcher = Dispatcher {
        modes: EnabledModes {
            short_otp: false,
            otp: true,
            hotp: true,
            totp: true,
            pwhash: true,
        },
        clients: ClientTable::parse(CLIENTS).unwrap(),
        store: Some(store.clone()),
        device: DeviceHandle::new(Box::new(device), Duration::from_secs(5)),
        hotp_window: 5,
        totp_interval: 30,
        totp_tolerance: 1,
    };
    Setup {
        dispatcher,
        store,
        _dir: dir,
    }
}

/// The code the enrolled key produces at `counter`, asked of a fresh
/// device sharing the same key material.
async fn code_at(counter: u64) -> u32 {
    let device = SoftDevice::new();
    let secret = device.load_secret(1, OATH_KEY);
    device.compute_code(&secret, counter, 6).await.unwrap()
}

async fn query(s: &Setup, q: &str) -> String {
    s.dispatcher.handle_query(q).await.unwrap()
}

#[tokio::test]
async fn hotp_accepts_within_window_and_refuses_replay() {
    let s = setup().await;
    let code = code_at(3).await;

    let res = query(&s, &format!("hotp={UID}{code:06}")).await;
    assert_eq!(res, "OK counter=0004");
    assert_eq!(s.store.get(UID).await.unwrap().unwrap().counter, 4);

    // The window now starts at 4; the same code can never be accepted again.
    let res = query(&s, &format!("hotp={UID}{code:06}")).await;
    assert_eq!(res, "ERR Could not validate OATH-HOTP OTP");
    assert_eq!(s.store.get(UID).await.unwrap().unwrap().counter, 4);
}

#[tokio::test]
async fn hotp_rejects_code_outside_window() {
    let s = setup().await;
    let code = code_at(5).await;
    let res = query(&s, &format!("hotp={UID}{code:06}")).await;
    assert_eq!(res, "ERR Could not validate OATH-HOTP OTP");
    assert_eq!(s.store.get(UID).await.unwrap().unwrap().counter, 0);
}

#[tokio::test]
async fn hotp_with_explicit_uid_parameter() {
    let s = setup().await;
    let code = code_at(0).await;
    let res = query(&s, &format!("hotp={code:06}&uid={UID}")).await;
    assert_eq!(res, "OK counter=0001");
}

#[tokio::test]
async fn hotp_lexical_and_lookup_failures() {
    let s = setup().await;
    // 'a' is outside the token alphabet
    assert_eq!(
        query(&s, "hotp=abc123").await,
        "ERR Invalid OATH-HOTP OTP"
    );
    // well-formed but too few digits for a code
    assert_eq!(
        query(&s, &format!("hotp={UID}12345")).await,
        "ERR Invalid OATH-HOTP input"
    );
    // unenrolled identity is indistinct from a backend fault
    let code = code_at(0).await;
    assert_eq!(
        query(&s, &format!("hotp=cccccccccccb{code:06}")).await,
        "ERR Internal error"
    );
}

#[tokio::test]
async fn totp_accepts_within_tolerance_and_refuses_replay() {
    let s = setup().await;
    let now = 49_154_324u64;
    let code = code_at(now - 1).await;
    let q = format!("totp={UID}{code:06}");

    let res = s.dispatcher.handle_query_at(&q, now).await.unwrap();
    assert_eq!(res, format!("OK timecounter={:04x}", now - 1));

    let res = s.dispatcher.handle_query_at(&q, now).await.unwrap();
    assert_eq!(res, "ERR replayed OATH-TOTP");
}

#[tokio::test]
async fn totp_rejects_outside_tolerance() {
    let s = setup().await;
    let now = 49_154_324u64;
    let code = code_at(now - 2).await;
    let q = format!("totp={UID}{code:06}");
    let res = s.dispatcher.handle_query_at(&q, now).await.unwrap();
    assert_eq!(res, "ERR Could not validate OATH-TOTP OTP");
}

#[tokio::test]
async fn disabled_modes_answer_explicitly() {
    let mut s = setup().await;
    s.dispatcher.modes = EnabledModes::default();
    assert_eq!(query(&s, "hotp=123456").await, "ERR 'hotp' disabled");
    assert_eq!(query(&s, "totp=123456").await, "ERR 'totp' disabled");
    assert_eq!(query(&s, "pwhash=x&nonce=0&aead=0&kh=1").await, "ERR 'pwhash' disabled");
    assert_eq!(
        query(&s, "otp=cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj").await,
        "ERR 'otp/otp2' disabled"
    );
}

#[tokio::test]
async fn no_mode_parameter_yields_no_response() {
    let s = setup().await;
    assert!(s.dispatcher.handle_query("nonce=0123456789abcdef").await.is_none());
}

fn parse_response(body: &str) -> ParamMap {
    ParamMap::from_pairs(
        body.lines()
            .map(|l| l.split_once('=').unwrap())
            .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

fn signed_query(pairs: &[(&str, &str)], key: &[u8]) -> String {
    let sig = signature::sign(
        &ParamMap::from_pairs(pairs.iter().map(|(k, v)| (*k, *v))),
        key,
    );
    let mut query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    query.push_str(&format!("&h={}", urlencoding::encode(&sig)));
    query
}

#[tokio::test]
async fn otp_v2_validates_signed_request_and_signs_response() {
    let s = setup().await;
    let otp = "cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj";
    let q = signed_query(
        &[("id", "1"), ("nonce", "0123456789abcdef"), ("otp", otp)],
        CLIENT_SECRET,
    );
    let body = query(&s, &q).await;
    let fields = parse_response(&body);
    assert_eq!(fields.first("status"), Some("OK"));
    assert_eq!(fields.first("otp"), Some(otp));
    assert_eq!(fields.first("nonce"), Some("0123456789abcdef"));
    assert_eq!(fields.first("sessioncounter"), Some("3"));
    assert_eq!(fields.first("sessionuse"), Some("1"));
    // the response signature must verify under the client key
    let expected = signature::sign(&fields, CLIENT_SECRET);
    assert_eq!(fields.first("h"), Some(expected.as_str()));
}

#[tokio::test]
async fn otp_v2_replay_is_reported() {
    let s = setup().await;
    let otp = "cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj";
    let q = format!("otp={otp}&nonce=0123456789abcdef");
    let first = parse_response(&query(&s, &q).await);
    assert_eq!(first.first("status"), Some("OK"));
    let second = parse_response(&query(&s, &q).await);
    assert_eq!(second.first("status"), Some("REPLAYED_OTP"));
}

#[tokio::test]
async fn otp_v2_missing_nonce() {
    let s = setup().await;
    let otp = "cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj";
    let fields = parse_response(&query(&s, &format!("otp={otp}")).await);
    assert_eq!(fields.first("status"), Some("MISSING_PARAMETER"));
}

#[tokio::test]
async fn otp_v2_unknown_client_and_bad_signature_share_a_shape() {
    let s = setup().await;
    let otp = "cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj";
    let nonce = "0123456789abcdef";

    let bad_sig = parse_response(
        &query(&s, &format!("otp={otp}&nonce={nonce}&id=1&h=bogus")).await,
    );
    let unknown = parse_response(
        &query(&s, &format!("otp={otp}&nonce={nonce}&id=999&h=bogus")).await,
    );
    assert_eq!(bad_sig.first("status"), Some("BAD_SIGNATURE"));
    assert_eq!(unknown.first("status"), Some("NO_SUCH_CLIENT"));

    // Same field set either way; in particular both carry a signature, the
    // unknown-client one made with the null key.
    let names = |p: &ParamMap| p.sorted_pairs().map(|(k, _)| k.to_string()).collect::<Vec<_>>();
    assert_eq!(names(&bad_sig), names(&unknown));
    let expected = signature::sign(&unknown, signature::NULL_KEY);
    assert_eq!(unknown.first("h"), Some(expected.as_str()));
}

#[tokio::test]
async fn short_otp_mode_reports_device_counters() {
    let mut s = setup().await;
    s.dispatcher.modes.short_otp = true;
    let otp = "cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj";
    let res = query(&s, &format!("otp={otp}")).await;
    assert_eq!(res, "OK counter=0003 low=1234 high=01 use=01");

    let res = query(&s, &format!("otp={otp}")).await;
    assert_eq!(res, "ERR YSM_OTP_REPLAY");
}

#[tokio::test]
async fn short_otp_rejects_bad_input() {
    let mut s = setup().await;
    s.dispatcher.modes.short_otp = true;
    assert_eq!(query(&s, "otp=tooshort").await, "ERR Invalid OTP");
}

async fn pwhash_setup() -> (Setup, String, String) {
    let s = setup().await;
    let record = s.store.get(UID).await.unwrap().unwrap();
    let nonce = hex::encode(&record.secret.nonce);
    let aead = hex::encode(&record.secret.aead);
    (s, nonce, aead)
}

#[tokio::test]
async fn pwhash_compares_inside_the_device() {
    let (s, nonce, aead) = pwhash_setup().await;
    // The enrolled plaintext is exactly the 20-byte key, no padding needed.
    let good = format!(
        "pwhash={}&nonce={nonce}&aead={aead}&kh=8192",
        urlencoding::encode(std::str::from_utf8(OATH_KEY).unwrap())
    );
    assert_eq!(query(&s, &good).await, "OK pwhash validated");

    let bad = format!("pwhash=wrong&nonce={nonce}&aead={aead}&kh=8192");
    assert_eq!(query(&s, &bad).await, "ERR Could not validate pwhash");
}

#[tokio::test]
async fn pwhash_accepts_hex_key_handle() {
    let (s, nonce, aead) = pwhash_setup().await;
    let q = format!(
        "pwhash={}&nonce={nonce}&aead={aead}&kh=0x2000",
        urlencoding::encode(std::str::from_utf8(OATH_KEY).unwrap())
    );
    assert_eq!(query(&s, &q).await, "OK pwhash validated");
}

#[tokio::test]
async fn pwhash_missing_parameter() {
    let s = setup().await;
    assert_eq!(
        query(&s, "pwhash=abc&nonce=00").await,
        "ERR Missing required parameter"
    );
}

/// A device whose channel never answers.
struct StalledDevice;

#[async_trait]
impl TrustDevice for StalledDevice {
    async fn compute_code(
        &self,
        _secret: &SecretRef,
        _counter: u64,
        _digits: usize,
    ) -> DeviceResult<u32> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(DeviceError::Transport("unreachable".into()))
    }

    async fn compare_secret(&self, _secret: &SecretRef, _candidate: &[u8]) -> DeviceResult<bool> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(DeviceError::Transport("unreachable".into()))
    }

    async fn validate_stored_otp(&self, _otp: &str) -> DeviceResult<StoredOtpCounters> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(DeviceError::Transport("unreachable".into()))
    }
}

#[tokio::test]
async fn stalled_device_times_out_into_a_rejection() {
    let soft = SoftDevice::new();
    let secret = soft.load_secret(8192, OATH_KEY);
    let dir = tempfile::tempdir().unwrap();
    let store = OathStore::open(&dir.path().join("val.db")).await.unwrap();
    store
        .add(&OathRecord {
            identity: UID.to_string(),
            secret,
            counter: 0,
        })
        .await
        .unwrap();

    let dispatcher = Dispatcher {
        modes: EnabledModes {
            short_otp: true,
            otp: false,
            hotp: true,
            totp: false,
            pwhash: false,
        },
        clients: ClientTable::default(),
        store: Some(store.clone()),
        device: DeviceHandle::new(Box::new(StalledDevice), Duration::from_millis(50)),
        hotp_window: 5,
        totp_interval: 30,
        totp_tolerance: 1,
    };

    let started = std::time::Instant::now();
    let res = dispatcher
        .handle_query(&format!("hotp={UID}755224"))
        .await
        .unwrap();
    assert_eq!(res, "ERR Could not validate OATH-HOTP OTP");
    // nothing was committed for the stalled attempt
    assert_eq!(store.get(UID).await.unwrap().unwrap().counter, 0);

    let res = dispatcher
        .handle_query("otp=cccccccccccbiucvrkjiegbhidrcicvlgrcgkgurhjnj")
        .await
        .unwrap();
    assert_eq!(res, "ERR YSM_TIMEOUT");

    assert!(started.elapsed() < Duration::from_secs(10));
}

async fn spawn_http(s: Setup) -> SocketAddr {
    let state = Arc::new(AppState {
        dispatcher: s.dispatcher,
        serve_url: "/otpval/validate?".to_string(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, http::router(state)).await.unwrap();
    });
    // keep the store's tempdir alive for the duration of the server task
    std::mem::forget(s._dir);
    addr
}

async fn http_get(addr: SocketAddr, target: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8(buf).unwrap();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn http_serves_only_the_configured_url() {
    let s = setup().await;
    let code = code_at(3).await;
    let addr = spawn_http(s).await;

    let (status, body) = http_get(addr, &format!("/otpval/validate?hotp={UID}{code:06}")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "OK counter=0004\n");

    let (status, _) = http_get(addr, "/somewhere/else?hotp=123456").await;
    assert_eq!(status, 403);

    // right URL, no mode parameter
    let (status, _) = http_get(addr, "/otpval/validate?nonce=0123456789abcdef").await;
    assert_eq!(status, 403);
}
