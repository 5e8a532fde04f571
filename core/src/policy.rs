//! Process-wide signal handling policy
//!
//! The policy controls how the supervisor reacts to signals: how long to wait
//! for voluntary exits before escalating to a forced kill, whether received
//! signals are forwarded to children, and whether the secondary user signal
//! is treated as a targeted worker-failure event.
//!
//! The launcher configures the policy once, before any group is started, and
//! both the process groups and the signal router read it through a shared
//! [`PolicyCell`]. Readers always observe the latest configured value.

use crate::{CoreError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Default grace period before escalating to SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Signal handling policy for a supervisor process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPolicy {
    /// How long to wait after the termination signal before a forced kill.
    /// Zero means escalate immediately with no wait.
    pub grace_period: Duration,
    /// Whether the secondary user signal (SIGUSR1) is handled as a targeted
    /// worker-failure event
    pub handle_secondary_signal: bool,
    /// Whether signals received by the parent are forwarded to every live
    /// child before the parent's own shutdown begins
    pub forward_signals: bool,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            handle_secondary_signal: false,
            forward_signals: true,
        }
    }
}

/// Partial reconfiguration of a [`SignalPolicy`].
///
/// Fields left as `None` keep their current value when the update is applied,
/// so an empty update leaves the policy unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyUpdate {
    /// New grace period, if supplied
    pub grace_period: Option<Duration>,
    /// New secondary-signal setting, if supplied
    pub handle_secondary_signal: Option<bool>,
    /// New forwarding setting, if supplied
    pub forward_signals: Option<bool>,
}

impl PolicyUpdate {
    /// Create an empty update that changes nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the grace period
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// Set whether the secondary signal is handled
    #[must_use]
    pub fn handle_secondary_signal(mut self, enabled: bool) -> Self {
        self.handle_secondary_signal = Some(enabled);
        self
    }

    /// Set whether received signals are forwarded to children
    #[must_use]
    pub fn forward_signals(mut self, enabled: bool) -> Self {
        self.forward_signals = Some(enabled);
        self
    }

    /// Build an update from a raw grace period in seconds, as supplied by
    /// launcher configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if the grace period is negative or not
    /// a finite number.
    pub fn from_raw(
        grace_period_secs: Option<f64>,
        handle_secondary_signal: Option<bool>,
        forward_signals: Option<bool>,
    ) -> Result<Self> {
        let grace_period = match grace_period_secs {
            Some(secs) => {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(CoreError::ConfigurationError(format!(
                        "gracePeriodSecs must be a non-negative number, got {secs}"
                    )));
                }
                Some(Duration::from_secs_f64(secs))
            }
            None => None,
        };

        Ok(Self {
            grace_period,
            handle_secondary_signal,
            forward_signals,
        })
    }

    /// Apply this update to a policy, returning the new policy
    #[must_use]
    pub fn apply(&self, current: SignalPolicy) -> SignalPolicy {
        SignalPolicy {
            grace_period: self.grace_period.unwrap_or(current.grace_period),
            handle_secondary_signal: self
                .handle_secondary_signal
                .unwrap_or(current.handle_secondary_signal),
            forward_signals: self.forward_signals.unwrap_or(current.forward_signals),
        }
    }
}

/// Shared handle to the active [`SignalPolicy`].
///
/// Clones share the same underlying policy. The launcher holds one clone to
/// reconfigure, groups and the router hold clones to read.
#[derive(Debug, Clone, Default)]
pub struct PolicyCell {
    inner: Arc<RwLock<SignalPolicy>>,
}

impl PolicyCell {
    /// Create a cell holding the given policy
    pub fn new(policy: SignalPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(policy)),
        }
    }

    /// Snapshot read of the active policy
    pub async fn current(&self) -> SignalPolicy {
        *self.inner.read().await
    }

    /// Apply a partial update, returning the resulting policy.
    ///
    /// Only the fields present in the update change; the rest keep their
    /// current values.
    pub async fn configure(&self, update: PolicyUpdate) -> SignalPolicy {
        let mut guard = self.inner.write().await;
        *guard = update.apply(*guard);
        debug!(
            "Signal policy configured: grace_period={:?} handle_secondary_signal={} forward_signals={}",
            guard.grace_period, guard.handle_secondary_signal, guard.forward_signals
        );
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = SignalPolicy::default();
        assert_eq!(policy.grace_period, Duration::from_secs(30));
        assert!(!policy.handle_secondary_signal);
        assert!(policy.forward_signals);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_unset_fields() {
        let cell = PolicyCell::default();

        let updated = cell
            .configure(PolicyUpdate::new().grace_period(Duration::from_secs(45)))
            .await;
        assert_eq!(updated.grace_period, Duration::from_secs(45));
        assert!(!updated.handle_secondary_signal);
        assert!(updated.forward_signals);

        let updated = cell
            .configure(PolicyUpdate::new().handle_secondary_signal(true))
            .await;
        assert_eq!(updated.grace_period, Duration::from_secs(45));
        assert!(updated.handle_secondary_signal);
        assert!(updated.forward_signals);
    }

    #[tokio::test]
    async fn test_empty_update_is_noop() {
        let cell = PolicyCell::default();
        let before = cell.current().await;
        let after = cell.configure(PolicyUpdate::new()).await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_explicit_overrides_read_back() {
        let cell = PolicyCell::default();
        cell.configure(
            PolicyUpdate::new()
                .grace_period(Duration::from_secs(45))
                .handle_secondary_signal(true)
                .forward_signals(false),
        )
        .await;

        let policy = cell.current().await;
        assert_eq!(policy.grace_period, Duration::from_secs(45));
        assert!(policy.handle_secondary_signal);
        assert!(!policy.forward_signals);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let cell = PolicyCell::default();
        let clone = cell.clone();
        cell.configure(PolicyUpdate::new().forward_signals(false))
            .await;
        assert!(!clone.current().await.forward_signals);
    }

    #[test]
    fn test_from_raw_rejects_negative_grace() {
        let err = PolicyUpdate::from_raw(Some(-1.0), None, None).unwrap_err();
        assert_eq!(err.code(), "CORE001");

        let err = PolicyUpdate::from_raw(Some(f64::NAN), None, None).unwrap_err();
        assert_eq!(err.code(), "CORE001");
    }

    #[test]
    fn test_from_raw_accepts_zero_grace() {
        let update = PolicyUpdate::from_raw(Some(0.0), None, Some(false)).unwrap();
        assert_eq!(update.grace_period, Some(Duration::ZERO));
        assert_eq!(update.forward_signals, Some(false));
        assert_eq!(update.handle_secondary_signal, None);
    }
}
