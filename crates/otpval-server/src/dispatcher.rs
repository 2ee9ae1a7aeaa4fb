//! Per-request validation state machine.
//!
//! Every inbound query resolves to exactly one response line. The validation
//! paths return [`ValidationError`] kinds internally; the mapping to the
//! generic external `ERR` lines happens once per mode, in the `*_reject`
//! functions below, so rejection classes cannot be told apart by callers
//! (other than mode policy errors, which are explicit).

use otpval_core::device::{DeviceError, DeviceHandle, SecretRef};
use otpval_core::error::{Result as ValResult, ValidationError};
use otpval_core::params::{EnabledModes, ParamMap, ValidationMode, ValidationRequest};
use otpval_core::response::{err_line, ok_line, ResponseBuilder};
use otpval_core::signature::{self, SignatureCheck};
use otpval_core::{clients::ClientTable, lexical, search};
use otpval_store::OathStore;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Dispatcher {
    pub modes: EnabledModes,
    pub clients: ClientTable,
    pub store: Option<OathStore>,
    pub device: DeviceHandle,
    pub hotp_window: u64,
    pub totp_interval: u64,
    pub totp_tolerance: u64,
}

/// Rejection line for the OATH modes. Invalid code, exhausted window and
/// device faults all collapse into the same "could not validate" shape.
fn oath_reject(err: &ValidationError, label: &str) -> String {
    match err {
        ValidationError::BadInput => err_line(&format!("Invalid OATH-{label} OTP")),
        ValidationError::MissingParameter(_) => err_line(&format!("Invalid OATH-{label} input")),
        ValidationError::InvalidCode | ValidationError::Device(_) => {
            err_line(&format!("Could not validate OATH-{label} OTP"))
        }
        ValidationError::Replayed => err_line(&format!("replayed OATH-{label}")),
        _ => err_line("Internal error"),
    }
}

/// Rejection line for the KSM-style short mode, which reports the raw
/// device status the way the device states it.
fn short_otp_reject(err: &ValidationError) -> String {
    match err {
        ValidationError::BadInput => err_line("Invalid OTP"),
        ValidationError::Device(e) => err_line(e.status_str()),
        _ => err_line("Internal error"),
    }
}

fn pwhash_reject(err: &ValidationError) -> String {
    match err {
        ValidationError::MissingParameter(_) => err_line("Missing required parameter"),
        ValidationError::BadInput => err_line("Invalid pwhash input"),
        _ => err_line("Could not validate pwhash"),
    }
}

impl Dispatcher {
    /// Handle one raw query string. `None` means the request selected no
    /// validation mode at all and the transport should refuse it outright.
    pub async fn handle_query(&self, query: &str) -> Option<String> {
        self.handle_query_at(query, self.current_time_step()).await
    }

    /// Like [`Self::handle_query`] with an explicit TOTP time step, so the
    /// clock can be pinned in tests.
    pub async fn handle_query_at(&self, query: &str, now_step: u64) -> Option<String> {
        let params = ParamMap::parse(query);
        let req = match ValidationRequest::classify(params, &self.modes) {
            Ok(req) => req,
            Err(ValidationError::ModeDisabled("none")) => {
                tracing::warn!(query, "no validation mode parameter in request");
                return None;
            }
            Err(ValidationError::ModeDisabled(selector)) => {
                tracing::info!(query, selector, "validation mode disabled");
                return Some(err_line(&format!("'{selector}' disabled")));
            }
            Err(err) => {
                tracing::info!(query, %err, "unclassifiable request");
                return Some(err_line("Invalid request"));
            }
        };
        let result = match req.mode {
            ValidationMode::ShortEventOtp => self
                .validate_short_otp(&req.params)
                .await
                .unwrap_or_else(|e| short_otp_reject(&e)),
            ValidationMode::EventOtp => self.validate_otp_v2(&req.params).await,
            ValidationMode::Hotp => self
                .validate_hotp(&req.params)
                .await
                .unwrap_or_else(|e| oath_reject(&e, "HOTP")),
            ValidationMode::Totp => self
                .validate_totp(&req.params, now_step)
                .await
                .unwrap_or_else(|e| oath_reject(&e, "TOTP")),
            ValidationMode::PasswordHash => self
                .validate_pwhash(&req.params)
                .await
                .unwrap_or_else(|e| pwhash_reject(&e)),
        };
        tracing::info!(
            mode = req.mode.label(),
            query = req.params.raw_query(),
            result = result.replace('\n', "&"),
            "validation result"
        );
        Some(result)
    }

    fn current_time_step(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now / self.totp_interval.max(1)
    }

    fn store(&self) -> ValResult<&OathStore> {
        self.store.as_ref().ok_or_else(|| {
            tracing::error!("record store not configured for this validation mode");
            ValidationError::Storage("record store not configured".into())
        })
    }

    async fn fetch_record(
        &self,
        store: &OathStore,
        uid: &str,
    ) -> ValResult<otpval_store::OathRecord> {
        match store.get(uid).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => {
                tracing::info!(uid, "identity not enrolled");
                Err(ValidationError::Storage(format!("'{uid}' not enrolled")))
            }
            Err(err) => {
                tracing::error!(uid, %err, "record lookup failed");
                Err(ValidationError::Storage(err.to_string()))
            }
        }
    }

    /// Event OTP against the device-internal database, KSM-style response.
    async fn validate_short_otp(&self, params: &ParamMap) -> ValResult<String> {
        let otp = params.first("otp").unwrap_or_default();
        if !lexical::event_otp_valid(otp) {
            tracing::info!(otp, "invalid event OTP");
            return Err(ValidationError::BadInput);
        }
        let device = self.device.acquire().await;
        let counters = tokio::time::timeout(
            self.device.op_timeout(),
            device.validate_stored_otp(otp),
        )
        .await
        .unwrap_or(Err(DeviceError::Timeout))
        .map_err(|err| {
            tracing::info!(otp, %err, "device rejected event OTP");
            err
        })?;
        Ok(ok_line(&format!(
            "counter={:04x} low={:04x} high={:02x} use={:02x}",
            counters.use_counter, counters.ts_low, counters.ts_high, counters.session_counter
        )))
    }

    /// Event OTP validation 2.0: signed request, signed multi-field
    /// response. The status field carries the rejection class here, so this
    /// path formats directly instead of going through a `*_reject` mapping.
    async fn validate_otp_v2(&self, params: &ParamMap) -> String {
        let mut vres = ResponseBuilder::new();
        let otp = params.first("otp").unwrap_or_default();
        if !lexical::event_otp_valid(otp) {
            tracing::info!(otp, "invalid event OTP");
            vres.set("status", "BAD_OTP");
        } else {
            vres.set("otp", otp);
        }
        match params.first("nonce") {
            None => {
                tracing::info!(otp, "no nonce in request");
                vres.set("status", "MISSING_PARAMETER");
            }
            Some(nonce) if !lexical::nonce_valid(nonce) => {
                tracing::info!(otp, nonce, "bad nonce length");
                vres.set("status", "MISSING_PARAMETER");
            }
            Some(nonce) => {
                vres.set("nonce", nonce);
            }
        }
        if let Some(sl) = params.first("sl") {
            if sl != "100" && sl != "secure" {
                tracing::info!(otp, sl, "sync level unsupported");
                vres.set("status", "BACKEND_ERROR");
            }
        }
        let check = signature::verify(params, &self.clients);
        if !check.is_valid() {
            // Unknown client and bad signature produce the same response
            // shape; only the signing key differs (null key for the
            // former). The distinction lives in the logs.
            let status = match &check {
                SignatureCheck::UnknownClient => "NO_SUCH_CLIENT",
                _ => "BAD_SIGNATURE",
            };
            tracing::info!(otp, status, "signature validation error");
            vres.set("status", status);
        }
        if !vres.contains("status") {
            let device = self.device.acquire().await;
            let outcome = tokio::time::timeout(
                self.device.op_timeout(),
                device.validate_stored_otp(otp),
            )
            .await
            .unwrap_or(Err(DeviceError::Timeout));
            match outcome {
                Ok(c) => {
                    vres.set("status", "OK");
                    vres.set("sessioncounter", c.use_counter.to_string());
                    vres.set("sessionuse", c.session_counter.to_string());
                    let ts = ((c.ts_high as u32) << 16 | c.ts_low as u32) / 8;
                    vres.set("timestamp", ts.to_string());
                    if params.contains("sl") {
                        vres.set("sl", "100");
                        if params.contains("timestamp") {
                            let t = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ0000");
                            vres.set("t", t.to_string());
                        }
                    }
                }
                Err(err) => {
                    let status = match err {
                        DeviceError::NotFound | DeviceError::Invalid => "BAD_OTP",
                        DeviceError::Replay => "REPLAYED_OTP",
                        DeviceError::Timeout | DeviceError::Transport(_) => "BACKEND_ERROR",
                    };
                    tracing::info!(otp, %err, status, "device rejected event OTP");
                    vres.set("status", status);
                }
            }
        }
        if let Some(key) = check.response_key() {
            vres.sign_with(key);
        }
        vres.render()
    }

    /// Resolve uid and code for an OATH request, either from an explicit
    /// `uid` parameter plus a bare numeric code, or from a combined token.
    fn oath_bits<'p>(
        &self,
        params: &'p ParamMap,
        selector: &str,
    ) -> Option<(&'p str, u32, usize)> {
        let token = params.first(selector)?;
        if let Some(uid) = params.first("uid") {
            if uid.is_empty() || token.len() < 6 || token.len() > 8 {
                return None;
            }
            let code = token.parse().ok()?;
            Some((uid, code, token.len()))
        } else {
            let (uid, code, digits) = lexical::split_oath_token(token)?;
            if uid.is_empty() {
                return None;
            }
            Some((uid, code, digits))
        }
    }

    async fn validate_hotp(&self, params: &ParamMap) -> ValResult<String> {
        let token = params.first("hotp").unwrap_or_default();
        if !lexical::oath_token_valid(token) {
            tracing::info!(token, "invalid OATH-HOTP token");
            return Err(ValidationError::BadInput);
        }
        let Some((uid, code, digits)) = self.oath_bits(params, "hotp") else {
            tracing::info!(token, "could not extract uid/code from OATH-HOTP request");
            return Err(ValidationError::MissingParameter("uid"));
        };
        let uid = uid.to_string();
        let store = self.store()?;
        let record = self.fetch_record(store, &uid).await?;

        let found = {
            let device = self.device.acquire().await;
            tokio::time::timeout(
                self.device.op_timeout(),
                search::search_hotp(
                    device.as_ref(),
                    &record.secret,
                    record.counter,
                    code,
                    digits,
                    self.hotp_window,
                ),
            )
            .await
            .unwrap_or(Err(DeviceError::Timeout))
            .map_err(|err| {
                tracing::error!(uid, %err, "device fault during HOTP search");
                err
            })?
        };
        let new_counter = found.ok_or_else(|| {
            tracing::info!(uid, record.counter, "no matching counter in window");
            ValidationError::InvalidCode
        })?;
        // The new counter must be persisted before we answer OK.
        match store.try_advance_counter(&uid, new_counter).await {
            Ok(true) => Ok(ok_line(&format!("counter={new_counter:04x}"))),
            Ok(false) => {
                tracing::info!(uid, new_counter, "counter advance lost (replay)");
                Err(ValidationError::Replayed)
            }
            Err(err) => {
                tracing::error!(uid, %err, "counter update failed");
                Err(ValidationError::Storage(err.to_string()))
            }
        }
    }

    async fn validate_totp(&self, params: &ParamMap, now_step: u64) -> ValResult<String> {
        let token = params.first("totp").unwrap_or_default();
        if !lexical::oath_token_valid(token) {
            tracing::info!(token, "invalid OATH-TOTP token");
            return Err(ValidationError::BadInput);
        }
        let Some((uid, code, digits)) = self.oath_bits(params, "totp") else {
            tracing::info!(token, "could not extract uid/code from OATH-TOTP request");
            return Err(ValidationError::MissingParameter("uid"));
        };
        let uid = uid.to_string();
        let store = self.store()?;
        let record = self.fetch_record(store, &uid).await?;

        let found = {
            let device = self.device.acquire().await;
            tokio::time::timeout(
                self.device.op_timeout(),
                search::search_totp(
                    device.as_ref(),
                    &record.secret,
                    now_step,
                    self.totp_tolerance,
                    code,
                    digits,
                ),
            )
            .await
            .unwrap_or(Err(DeviceError::Timeout))
            .map_err(|err| {
                tracing::error!(uid, %err, "device fault during TOTP search");
                err
            })?
        };
        let timecounter = found.ok_or_else(|| {
            tracing::info!(uid, now_step, "no matching time step in tolerance");
            ValidationError::InvalidCode
        })?;
        // A matching step that does not strictly advance the stored value
        // is a replay inside the tolerance window.
        match store.try_advance_counter(&uid, timecounter).await {
            Ok(true) => Ok(ok_line(&format!("timecounter={timecounter:04x}"))),
            Ok(false) => {
                tracing::info!(uid, timecounter, "time counter advance lost (replay)");
                Err(ValidationError::Replayed)
            }
            Err(err) => {
                tracing::error!(uid, %err, "time counter update failed");
                Err(ValidationError::Storage(err.to_string()))
            }
        }
    }

    async fn validate_pwhash(&self, params: &ParamMap) -> ValResult<String> {
        let (Some(pwhash), Some(nonce), Some(aead), Some(kh)) = (
            params.first("pwhash"),
            params.first("nonce"),
            params.first("aead"),
            params.first("kh"),
        ) else {
            tracing::info!("missing parameter in pwhash request (pwhash, nonce, aead or kh)");
            return Err(ValidationError::MissingParameter("pwhash/nonce/aead/kh"));
        };
        let (Ok(nonce), Ok(aead), Some(key_handle)) = (
            hex::decode(nonce),
            hex::decode(aead),
            lexical::parse_key_handle(kh),
        ) else {
            tracing::info!("undecodable pwhash request fields");
            return Err(ValidationError::BadInput);
        };
        let secret = SecretRef {
            key_handle,
            nonce,
            aead,
        };
        let plaintext_len = secret.plaintext_len();
        if pwhash.len() > plaintext_len {
            tracing::info!("supplied hash longer than sealed plaintext");
            return Err(ValidationError::InvalidCode);
        }
        let mut candidate = pwhash.as_bytes().to_vec();
        candidate.resize(plaintext_len, 0);

        let device = self.device.acquire().await;
        let matched = tokio::time::timeout(
            self.device.op_timeout(),
            device.compare_secret(&secret, &candidate),
        )
        .await
        .unwrap_or(Err(DeviceError::Timeout))
        .map_err(|err| {
            tracing::error!(%err, "device fault during pwhash comparison");
            err
        })?;
        if matched {
            Ok(ok_line("pwhash validated"))
        } else {
            tracing::info!("pwhash comparison failed");
            Err(ValidationError::InvalidCode)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oath_rejections_collapse_to_mode_lines() {
        let could_not = "ERR Could not validate OATH-HOTP OTP";
        assert_eq!(oath_reject(&ValidationError::InvalidCode, "HOTP"), could_not);
        assert_eq!(
            oath_reject(&ValidationError::Device(DeviceError::Timeout), "HOTP"),
            could_not
        );
        assert_eq!(
            oath_reject(&ValidationError::Device(DeviceError::NotFound), "HOTP"),
            could_not
        );
        assert_eq!(
            oath_reject(&ValidationError::BadInput, "TOTP"),
            "ERR Invalid OATH-TOTP OTP"
        );
        assert_eq!(
            oath_reject(&ValidationError::Replayed, "TOTP"),
            "ERR replayed OATH-TOTP"
        );
        assert_eq!(
            oath_reject(&ValidationError::Storage("lost".into()), "HOTP"),
            "ERR Internal error"
        );
    }

    #[test]
    fn short_otp_rejections_report_device_status() {
        assert_eq!(
            short_otp_reject(&ValidationError::Device(DeviceError::Replay)),
            "ERR YSM_OTP_REPLAY"
        );
        assert_eq!(
            short_otp_reject(&ValidationError::Device(DeviceError::Timeout)),
            "ERR YSM_TIMEOUT"
        );
        assert_eq!(
            short_otp_reject(&ValidationError::BadInput),
            "ERR Invalid OTP"
        );
    }

    #[test]
    fn pwhash_rejections() {
        assert_eq!(
            pwhash_reject(&ValidationError::MissingParameter("kh")),
            "ERR Missing required parameter"
        );
        assert_eq!(
            pwhash_reject(&ValidationError::InvalidCode),
            "ERR Could not validate pwhash"
        );
        assert_eq!(
            pwhash_reject(&ValidationError::Device(DeviceError::Timeout)),
            "ERR Could not validate pwhash"
        );
    }
}
