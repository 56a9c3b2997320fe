//! Polling, amount conversion and assertion helpers shared by tests

use crate::constants::COIN;
use crate::error::{HarnessError, Result};
use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

/// Default pause between polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `pred` until it yields a value or `timeout` passes
///
/// Errors from `pred` are returned immediately.
pub fn wait_for<T>(
    timeout: Duration,
    what: &str,
    pred: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    wait_for_with(timeout, POLL_INTERVAL, || what.to_string(), pred)
}

/// [`wait_for`] with a custom poll interval and a lazily built diagnostic
pub fn wait_for_with<T>(
    timeout: Duration,
    sleep: Duration,
    on_error: impl FnOnce() -> String,
    mut pred: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = pred()? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(HarnessError::Timeout(format!("{} (after {:?})", on_error(), timeout)));
        }
        thread::sleep(sleep);
    }
}

/// Satoshis from a decimal coin string, truncating beyond 8 places
pub fn btc_to_satoshi(amount: &str) -> Result<i64> {
    let invalid = || HarnessError::InvalidArgument(format!("invalid amount {:?}", amount));
    let trimmed = amount.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let mut frac_sats = 0i64;
    for (i, b) in frac.bytes().take(8).enumerate() {
        frac_sats += i64::from(b - b'0') * 10i64.pow(7 - i as u32);
    }
    let sats = whole
        .checked_mul(COIN)
        .and_then(|w| w.checked_add(frac_sats))
        .ok_or_else(invalid)?;
    Ok(if negative { -sats } else { sats })
}

/// Satoshis from a JSON number as returned by the node's RPC
pub fn btc_value_to_satoshi(value: &serde_json::Value) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => btc_to_satoshi(&n.to_string()),
        serde_json::Value::String(s) => btc_to_satoshi(s),
        other => Err(HarnessError::InvalidArgument(format!("not an amount: {}", other))),
    }
}

/// Decimal coin string with 8 fractional digits
pub fn satoshi_to_btc(sats: i64) -> String {
    let sign = if sats < 0 { "-" } else { "" };
    let abs = sats.unsigned_abs();
    let coin = COIN as u64;
    format!("{}{}.{:08}", sign, abs / coin, abs % coin)
}

pub fn assert_equal<T: PartialEq + Debug>(actual: T, expected: T) -> Result<()> {
    if actual != expected {
        return Err(HarnessError::AssertionFailed(format!("{:?} != {:?}", actual, expected)));
    }
    Ok(())
}

pub fn assert_greater_than<T: PartialOrd + Debug>(a: T, b: T) -> Result<()> {
    if a <= b {
        return Err(HarnessError::AssertionFailed(format!("{:?} <= {:?}", a, b)));
    }
    Ok(())
}

/// Require `f` to fail with RPC `code` and a message containing `message`
pub fn assert_raises_rpc_error<T: Debug>(
    code: i64,
    message: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<()> {
    match f() {
        Err(HarnessError::Rpc { code: got, message: text }) => {
            if got != code {
                return Err(HarnessError::AssertionFailed(format!(
                    "unexpected RPC error code {} (expected {}): {}",
                    got, code, text
                )));
            }
            if !text.contains(message) {
                return Err(HarnessError::AssertionFailed(format!(
                    "expected RPC error containing \"{}\", got \"{}\"",
                    message, text
                )));
            }
            Ok(())
        }
        Err(other) => Err(HarnessError::AssertionFailed(format!("unexpected error: {}", other))),
        Ok(value) => Err(HarnessError::AssertionFailed(format!("no error raised, got {:?}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_amount_truncates_extra_digits() {
        assert_eq!(btc_to_satoshi("1").unwrap(), COIN);
        assert_eq!(btc_to_satoshi("0.00000001").unwrap(), 1);
        assert_eq!(btc_to_satoshi("0.000000019").unwrap(), 1);
        assert_eq!(btc_to_satoshi("12.5").unwrap(), 1_250_000_000);
        assert_eq!(btc_to_satoshi("-0.1").unwrap(), -10_000_000);
        assert_eq!(btc_to_satoshi(".5").unwrap(), 50_000_000);
        assert!(btc_to_satoshi("abc").is_err());
        assert!(btc_to_satoshi(".").is_err());
        assert!(btc_to_satoshi("1e5").is_err());
    }

    #[test]
    fn test_amount_from_json() {
        let v: serde_json::Value = serde_json::from_str("49.99995").unwrap();
        assert_eq!(btc_value_to_satoshi(&v).unwrap(), 4_999_995_000);
    }

    #[test]
    fn test_satoshi_formatting() {
        assert_eq!(satoshi_to_btc(150_000_001), "1.50000001");
        assert_eq!(satoshi_to_btc(-5), "-0.00000005");
    }

    #[test]
    fn test_wait_for_returns_first_value() {
        let calls = Cell::new(0);
        let got = wait_for(Duration::from_secs(5), "counter", || {
            calls.set(calls.get() + 1);
            Ok((calls.get() >= 3).then_some(calls.get()))
        })
        .unwrap();
        assert_eq!(got, 3);
    }

    #[test]
    fn test_wait_for_times_out() {
        let err = wait_for(Duration::from_millis(120), "never", || Ok(None::<()>)).unwrap_err();
        match err {
            HarnessError::Timeout(msg) => assert!(msg.contains("never")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_assert_raises_rpc_error() {
        assert!(assert_raises_rpc_error(-8, "out of range", || {
            Err::<(), _>(HarnessError::from_rpc(-8, "Block height out of range"))
        })
        .is_ok());
        assert!(assert_raises_rpc_error(-8, "x", || Ok(1)).is_err());
        assert!(assert_raises_rpc_error(-5, "out of range", || {
            Err::<(), _>(HarnessError::from_rpc(-8, "Block height out of range"))
        })
        .is_err());
    }

    #[test]
    fn test_assert_helpers() {
        assert!(assert_equal(1, 1).is_ok());
        assert!(assert_equal("a", "b").is_err());
        assert!(assert_greater_than(2, 1).is_ok());
        assert!(assert_greater_than(1, 1).is_err());
    }
}
