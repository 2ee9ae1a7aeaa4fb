//! Bounded candidate search over the trust device.
//!
//! Both searches issue a sequential series of device probes and never widen
//! their window on failure; an exhausted window is the normal outcome for a
//! wrong, expired, or replayed code. The caller holds the device channel
//! for the duration of the search.

use crate::device::{DeviceResult, SecretRef, TrustDevice};

/// Probe counters `[start, start + window)` in increasing order.
///
/// Returns the counter *following* the match, so a successful store advance
/// is always strictly greater than the matched value. `None` means no
/// counter in the window produced `code`.
pub async fn search_hotp<D>(
    device: &D,
    secret: &SecretRef,
    start: u64,
    code: u32,
    digits: usize,
    window: u64,
) -> DeviceResult<Option<u64>>
where
    D: TrustDevice + ?Sized,
{
    for counter in start..start.saturating_add(window) {
        if device.compute_code(secret, counter, digits).await? == code {
            return Ok(Some(counter + 1));
        }
    }
    Ok(None)
}

/// Probe time counters `[now - tolerance, now + tolerance]` in increasing
/// order and return the first matching one.
pub async fn search_totp<D>(
    device: &D,
    secret: &SecretRef,
    now_step: u64,
    tolerance: u64,
    code: u32,
    digits: usize,
) -> DeviceResult<Option<u64>>
where
    D: TrustDevice + ?Sized,
{
    let first = now_step.saturating_sub(tolerance);
    let last = now_step.saturating_add(tolerance);
    for step in first..=last {
        if device.compute_code(secret, step, digits).await? == code {
            return Ok(Some(step));
        }
    }
    Ok(None)
}
