//! Trust-device gateway boundary.
//!
//! The engine never sees plaintext secrets: every cryptographic operation is
//! delegated through [`TrustDevice`], which hands the device an opaque
//! [`SecretRef`] and gets back a code, a comparison verdict, or the
//! device-internal database counters. The physical transport behind the
//! trait is out of scope here.
//!
//! The device is a single exclusive-access channel. [`DeviceHandle`] wraps
//! an implementation in an async mutex so a multi-step operation (such as a
//! bounded candidate search) is never interleaved with another request's
//! device calls.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex as SyncMutex;
use sha1::Sha1;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Trailing MAC bytes of an AEAD blob; plaintext length is the blob length
/// minus this.
pub const AEAD_MAC_SIZE: usize = 8;

/// Length of the modhex public identity prefix of an event OTP.
pub const PUBLIC_ID_LEN: usize = 12;

/// Ciphertext portion of an event OTP, in modhex characters.
pub const OTP_CIPHERTEXT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("identity not found in device database")]
    NotFound,

    #[error("device reported replayed OTP")]
    Replay,

    #[error("device reported invalid OTP")]
    Invalid,

    #[error("device operation timed out")]
    Timeout,

    #[error("device transport error: {0}")]
    Transport(String),
}

impl DeviceError {
    /// Short device-status string used in KSM-style `ERR` lines.
    pub fn status_str(&self) -> &'static str {
        match self {
            DeviceError::NotFound => "YSM_ID_NOT_FOUND",
            DeviceError::Replay => "YSM_OTP_REPLAY",
            DeviceError::Invalid => "YSM_OTP_INVALID",
            DeviceError::Timeout => "YSM_TIMEOUT",
            DeviceError::Transport(_) => "YSM_TRANSPORT_ERROR",
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Opaque reference to a secret only the device can use.
///
/// The AEAD blob is never inspected by the engine; it is carried between
/// the record store and the device verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub key_handle: u32,
    pub nonce: Vec<u8>,
    pub aead: Vec<u8>,
}

impl SecretRef {
    /// Plaintext length hidden inside the AEAD blob.
    pub fn plaintext_len(&self) -> usize {
        self.aead.len().saturating_sub(AEAD_MAC_SIZE)
    }
}

/// Counters reported by the device-internal event-OTP database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredOtpCounters {
    pub use_counter: u16,
    pub session_counter: u8,
    pub ts_high: u8,
    pub ts_low: u16,
}

/// Operations the trust device performs on the engine's behalf.
#[async_trait]
pub trait TrustDevice: Send + Sync {
    /// Compute the `digits`-digit OATH code for `counter` using the key
    /// sealed in `secret`.
    async fn compute_code(
        &self,
        secret: &SecretRef,
        counter: u64,
        digits: usize,
    ) -> DeviceResult<u32>;

    /// Compare `candidate` against the plaintext sealed in `secret`.
    ///
    /// The comparison happens inside the device; the engine only learns the
    /// verdict.
    async fn compare_secret(&self, secret: &SecretRef, candidate: &[u8]) -> DeviceResult<bool>;

    /// Validate an event OTP against the device-internal database.
    async fn validate_stored_otp(&self, otp: &str) -> DeviceResult<StoredOtpCounters>;
}

/// Exclusive-access wrapper around the single device channel.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Mutex<Box<dyn TrustDevice>>>,
    op_timeout: Duration,
}

pub type DeviceGuard<'a> = MutexGuard<'a, Box<dyn TrustDevice>>;

impl DeviceHandle {
    pub fn new(device: Box<dyn TrustDevice>, op_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(device)),
            op_timeout,
        }
    }

    /// Acquire the channel. Held across an entire multi-step operation.
    pub async fn acquire(&self) -> DeviceGuard<'_> {
        self.inner.lock().await
    }

    /// Budget for one device round-trip sequence; callers wrap their device
    /// work in `tokio::time::timeout` with this and map expiry to
    /// [`DeviceError::Timeout`].
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }
}

/// Dynamic truncation per RFC 4226 §5.3.
fn truncate_code(mac: &[u8], digits: usize) -> u32 {
    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        mac[offset] & 0x7f,
        mac[offset + 1],
        mac[offset + 2],
        mac[offset + 3],
    ]);
    bin % 10u32.pow(digits as u32)
}

#[derive(Debug)]
struct SoftSecret {
    plaintext: Vec<u8>,
    aead: Vec<u8>,
}

#[derive(Debug)]
struct SoftYubikey {
    counters: StoredOtpCounters,
    seen: HashSet<String>,
}

/// In-memory software stand-in for the hardware device.
///
/// Behaves like the real thing at the trait boundary: secrets go in once
/// through [`SoftDevice::load_secret`] and afterwards only opaque
/// [`SecretRef`]s circulate. Backs the test suites and the enrollment tool.
#[derive(Default)]
pub struct SoftDevice {
    secrets: SyncMutex<HashMap<(u32, Vec<u8>), SoftSecret>>,
    yubikeys: SyncMutex<HashMap<String, SoftYubikey>>,
    nonce_seq: AtomicU64,
}

impl SoftDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `plaintext` under `key_handle`, returning the opaque reference
    /// the engine will use from now on.
    pub fn load_secret(&self, key_handle: u32, plaintext: &[u8]) -> SecretRef {
        let seq = self.nonce_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = seq.to_be_bytes()[2..].to_vec();
        // Stand-in blob: plaintext-sized body plus MAC-sized tail. Content
        // is irrelevant as long as it matches what the device stored.
        let mut aead = vec![0u8; plaintext.len() + AEAD_MAC_SIZE];
        for (i, b) in aead.iter_mut().enumerate() {
            *b = (seq as u8).wrapping_add(i as u8);
        }
        let secret = SecretRef {
            key_handle,
            nonce: nonce.clone(),
            aead: aead.clone(),
        };
        self.secrets
            .lock()
            .insert((key_handle, nonce), SoftSecret {
                plaintext: plaintext.to_vec(),
                aead,
            });
        secret
    }

    /// Register an event-OTP identity in the internal database.
    pub fn import_yubikey(&self, public_id: &str, counters: StoredOtpCounters) {
        self.yubikeys.lock().insert(
            public_id.to_string(),
            SoftYubikey {
                counters,
                seen: HashSet::new(),
            },
        );
    }

    fn unseal(&self, secret: &SecretRef) -> DeviceResult<Vec<u8>> {
        let secrets = self.secrets.lock();
        let stored = secrets
            .get(&(secret.key_handle, secret.nonce.clone()))
            .ok_or(DeviceError::NotFound)?;
        if stored.aead != secret.aead {
            return Err(DeviceError::Invalid);
        }
        Ok(stored.plaintext.clone())
    }
}

#[async_trait]
impl TrustDevice for SoftDevice {
    async fn compute_code(
        &self,
        secret: &SecretRef,
        counter: u64,
        digits: usize,
    ) -> DeviceResult<u32> {
        let key = self.unseal(secret)?;
        let mut mac = Hmac::<Sha1>::new_from_slice(&key)
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        mac.update(&counter.to_be_bytes());
        Ok(truncate_code(&mac.finalize().into_bytes(), digits))
    }

    async fn compare_secret(&self, secret: &SecretRef, candidate: &[u8]) -> DeviceResult<bool> {
        let plaintext = self.unseal(secret)?;
        if plaintext.len() != candidate.len() {
            return Ok(false);
        }
        let mut diff = 0u8;
        for (a, b) in plaintext.iter().zip(candidate) {
            diff |= a ^ b;
        }
        Ok(diff == 0)
    }

    async fn validate_stored_otp(&self, otp: &str) -> DeviceResult<StoredOtpCounters> {
        if otp.len() < PUBLIC_ID_LEN + OTP_CIPHERTEXT_LEN {
            return Err(DeviceError::Invalid);
        }
        let public_id = &otp[..otp.len() - OTP_CIPHERTEXT_LEN];
        let mut yubikeys = self.yubikeys.lock();
        let state = yubikeys.get_mut(public_id).ok_or(DeviceError::NotFound)?;
        if !state.seen.insert(otp.to_string()) {
            return Err(DeviceError::Replay);
        }
        state.counters.session_counter = state.counters.session_counter.wrapping_add(1);
        Ok(state.counters)
    }
}
