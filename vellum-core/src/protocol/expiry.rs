//! Document expiry validation and wire encoding.
//!
//! The wire carries expiry as an unsigned 32-bit integer with a dual
//! meaning: values below thirty days of seconds are a relative duration,
//! anything at or above is an absolute epoch second. The constructors
//! validate up front so an expiry can never silently flip interpretation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, VellumError};

/// Thirty days in seconds, the server's relative/absolute cutover.
const RELATIVE_CUTOVER_SECS: u64 = 30 * 24 * 60 * 60;

/// The longest relative expiry accepted, fifty years.
const MAX_RELATIVE_SECS: u64 = 50 * 365 * 24 * 60 * 60;

/// A validated document expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The document never expires.
    None,
    /// Expire the given duration from now.
    Relative(Duration),
    /// Expire at the given epoch second.
    Absolute(u64),
}

impl Expiry {
    /// Creates a relative expiry, validating `0s < d <= 50 years`.
    pub fn relative(duration: Duration) -> Result<Self> {
        let secs = duration.as_secs();
        if duration.is_zero() {
            return Err(VellumError::InvalidArgument(
                "expiry duration must be greater than zero".to_string(),
            ));
        }
        if secs > MAX_RELATIVE_SECS || (secs == MAX_RELATIVE_SECS && duration.subsec_nanos() > 0) {
            return Err(VellumError::InvalidArgument(format!(
                "expiry duration of {:?} exceeds the fifty year maximum",
                duration
            )));
        }
        Ok(Expiry::Relative(duration))
    }

    /// Creates an absolute expiry from an epoch second.
    ///
    /// Zero is valid and means "no expiry". Values between zero and the
    /// thirty-day cutover would be reinterpreted as durations by the
    /// server, so they are rejected as almost certainly a programming
    /// error. Values beyond the u32 range cannot be carried on the wire.
    pub fn absolute(epoch_secs: u64) -> Result<Self> {
        if epoch_secs == 0 {
            return Ok(Expiry::Absolute(0));
        }
        if epoch_secs < RELATIVE_CUTOVER_SECS {
            return Err(VellumError::InvalidArgument(format!(
                "absolute expiry {} would be misread as a relative duration",
                epoch_secs
            )));
        }
        if epoch_secs > u32::MAX as u64 {
            return Err(VellumError::InvalidArgument(format!(
                "absolute expiry {} does not fit the 32-bit wire field",
                epoch_secs
            )));
        }
        Ok(Expiry::Absolute(epoch_secs))
    }

    /// Encodes this expiry against the current wall clock.
    pub fn encode(&self) -> Result<u32> {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| VellumError::InvalidArgument(format!("system clock error: {}", e)))?
            .as_millis() as u64;
        self.encode_at(now_millis)
    }

    /// Encodes this expiry against an explicit clock, in epoch millis.
    ///
    /// Relative durations below the thirty-day cutover are carried
    /// verbatim as seconds; longer durations are converted to the epoch
    /// second at which they elapse.
    pub fn encode_at(&self, now_millis: u64) -> Result<u32> {
        match self {
            Expiry::None => Ok(0),
            Expiry::Absolute(secs) => Ok(*secs as u32),
            Expiry::Relative(duration) => {
                let secs = duration.as_secs();
                if secs < RELATIVE_CUTOVER_SECS {
                    return Ok(secs as u32);
                }
                let epoch = (now_millis / 1000) + secs;
                if epoch > u32::MAX as u64 {
                    return Err(VellumError::InvalidArgument(format!(
                        "expiry duration of {:?} ends past the end of the 32-bit epoch",
                        duration
                    )));
                }
                Ok(epoch as u32)
            }
        }
    }
}
