//! Connection recovery for device workers.
//!
//! A worker in `Connecting` calls [`connect_with_recovery`], which applies a
//! [`RetryPolicy`]: up to `max_attempts` plain `connect()` calls separated by an
//! exponentially growing backoff, then a single hard `reset()` followed by one
//! final `connect()`. The stop signal is honoured between every step so an
//! operator interrupt never waits out a long backoff.

use crate::error::TransportError;
use crate::hardware::capabilities::Connectable;
use crate::shutdown::ShutdownSignal;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Defines a policy for retrying a device connection.
///
/// # Example
///
/// ```rust
/// use gas_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
///     backoff_multiplier: 2.0,
/// };
/// assert_eq!(policy.delay_after(2), Duration::from_millis(400));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Plain connect attempts before falling back to a reset.
    ///
    /// Set to 0 to go straight to reset + connect.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub backoff_delay: Duration,

    /// Factor applied to the delay after each further failure (1.0 = constant).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// Two attempts, 1 s initial backoff, doubling.
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Upper bound on any single backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl RetryPolicy {
    /// Backoff to wait after failed attempt number `attempt` (1-based).
    ///
    /// Saturates at [`MAX_BACKOFF`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.backoff_delay.as_secs_f64() * factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// Why [`connect_with_recovery`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryError {
    /// A coordinated stop arrived while still connecting.
    Cancelled,
    /// Every attempt, including the post-reset one, failed. Carries the last error.
    Exhausted(TransportError),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryError::Cancelled => write!(f, "connection cancelled by stop request"),
            RecoveryError::Exhausted(err) => {
                write!(f, "connection failed after reset: {}", err)
            }
        }
    }
}

/// Connect `device`, retrying per `policy` and falling back to one hard reset.
pub async fn connect_with_recovery<D: Connectable>(
    device: &mut D,
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
) -> Result<D::Handle, RecoveryError> {
    for attempt in 1..=policy.max_attempts {
        if shutdown.is_triggered() {
            return Err(RecoveryError::Cancelled);
        }
        match device.connect().await {
            Ok(handle) => {
                info!(device = device.device_id(), attempt, "connected");
                return Ok(handle);
            }
            Err(err) => {
                warn!(
                    device = device.device_id(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "connect failed"
                );
            }
        }
        pause(policy.delay_after(attempt), shutdown).await?;
    }

    if shutdown.is_triggered() {
        return Err(RecoveryError::Cancelled);
    }
    info!(device = device.device_id(), "performing hard reset before final connect");
    if let Err(err) = device.reset().await {
        warn!(device = device.device_id(), error = %err, "hard reset failed");
    }

    if shutdown.is_triggered() {
        return Err(RecoveryError::Cancelled);
    }
    match device.connect().await {
        Ok(handle) => {
            info!(device = device.device_id(), "connected after hard reset");
            Ok(handle)
        }
        Err(err) => {
            warn!(device = device.device_id(), error = %err, "connect after reset failed");
            Err(RecoveryError::Exhausted(err))
        }
    }
}

async fn pause(delay: Duration, shutdown: &ShutdownSignal) -> Result<(), RecoveryError> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = shutdown.triggered() => Err(RecoveryError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}
