//! Signal routing between the launcher process and its groups
//!
//! The router owns the launcher's signal handling: a dedicated listener
//! thread blocks on the configured signal set and hands every delivery,
//! together with its origin PID, to an async control task. The control task
//! consults the active [`SignalPolicy`](crate::policy::SignalPolicy) and
//! drives the attached groups:
//!
//! - An ordinary shutdown signal is forwarded to every live worker first
//!   (when forwarding is enabled), then every attached group is closed, and
//!   finally the signal's default behavior is re-raised so the launcher
//!   itself dies of it.
//! - The secondary user signal, when handled by policy, is attributed to the
//!   worker that raised it via the sender PID: that rank gets an injected
//!   failure and only its group is closed. The launcher does not re-raise.
//!
//! Nothing signal-unsafe happens on the handler path; the OS handler only
//! feeds the iterator the listener thread blocks on.

use crate::group::ProcessGroup;
use crate::policy::PolicyCell;
use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use schema::Rank;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use signal_hook::iterator::exfiltrator::WithOrigin;
use signal_hook::iterator::SignalsInfo;
use signal_hook::low_level;

/// Capacity of the router notification channel
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// Parse a comma separated list of signal names into signals.
///
/// Names are case insensitive and must be the full `SIG*` form. Duplicates
/// are dropped, keeping first-occurrence order.
///
/// # Errors
///
/// Returns a `ConfigurationError` naming the offending token when a name is
/// not a known signal, or when the list contains no names at all.
pub fn parse_signal_names(raw: &str) -> Result<Vec<Signal>> {
    let mut signals = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let canonical = token.to_ascii_uppercase();
        let signal = Signal::from_str(&canonical).map_err(|_| {
            CoreError::ConfigurationError(format!("Invalid signal name '{token}'"))
        })?;
        if !signals.contains(&signal) {
            signals.push(signal);
        }
    }
    if signals.is_empty() {
        return Err(CoreError::ConfigurationError(
            "Signal list contains no signal names".to_string(),
        ));
    }
    Ok(signals)
}

/// Notifications about what the router did with a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A monitored signal arrived
    Received {
        /// Raw signal number
        signal: i32,
        /// PID of the sender, when the kernel reported one
        origin_pid: Option<u32>,
    },
    /// The signal was forwarded to these worker PIDs
    Forwarded {
        /// Raw signal number
        signal: i32,
        /// PIDs the signal was delivered to, across all groups
        pids: Vec<u32>,
    },
    /// A secondary signal was attributed to a rank
    SecondaryAttributed {
        /// Name of the owning group
        group: String,
        /// Rank the failure was recorded for
        rank: Rank,
        /// PID of the worker that raised the signal
        origin_pid: u32,
    },
    /// The groups affected by the signal have been closed
    Closed {
        /// Raw signal number
        signal: i32,
    },
}

/// Router configuration
pub struct RouterConfig {
    /// Shared signal handling policy
    pub policy: PolicyCell,
    /// The signal workers use to report their own failure
    pub secondary_signal: Signal,
    /// Whether an ordinary shutdown signal is re-raised with its default
    /// behavior after the groups are closed. Disabled in tests so the test
    /// process survives.
    pub reraise: bool,
}

impl RouterConfig {
    /// Configuration with the given policy, SIGUSR1 as the secondary signal
    /// and re-raising enabled
    pub fn new(policy: PolicyCell) -> Self {
        Self {
            policy,
            secondary_signal: Signal::SIGUSR1,
            reraise: true,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new(PolicyCell::default())
    }
}

/// One delivered signal with its exfiltrated origin
struct SignalOrigin {
    signal: i32,
    origin_pid: Option<u32>,
}

/// A live handler installation
struct Installation {
    handle: signal_hook::iterator::Handle,
    listener: std::thread::JoinHandle<()>,
    control: tokio::task::JoinHandle<()>,
    signals: Vec<Signal>,
}

/// Process-wide signal router.
///
/// Attach groups, install a signal set, and the router takes care of
/// forwarding, shutdown and secondary-signal attribution. Installing a new
/// signal set replaces the previous installation.
pub struct SignalRouter {
    policy: PolicyCell,
    secondary_signal: Signal,
    reraise: bool,
    groups: Arc<Mutex<Vec<Arc<dyn ProcessGroup>>>>,
    installed: std::sync::Mutex<Option<Installation>>,
    notify_tx: broadcast::Sender<RouterEvent>,
}

impl SignalRouter {
    /// Create a router; no handlers are installed yet
    pub fn new(config: RouterConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self {
            policy: config.policy,
            secondary_signal: config.secondary_signal,
            reraise: config.reraise,
            groups: Arc::new(Mutex::new(Vec::new())),
            installed: std::sync::Mutex::new(None),
            notify_tx,
        }
    }

    /// Attach a group to be managed by incoming signals
    pub async fn attach(&self, group: Arc<dyn ProcessGroup>) {
        debug!("Attaching group '{}' to signal router", group.name());
        self.groups.lock().await.push(group);
    }

    /// Detach every group. Installed handlers stay active but see no groups.
    pub async fn detach_all(&self) {
        self.groups.lock().await.clear();
    }

    /// Subscribe to router notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.notify_tx.subscribe()
    }

    /// Install handlers for the given signal set, replacing any previous
    /// installation.
    ///
    /// Must be called from within a Tokio runtime; the control task is
    /// spawned on it.
    ///
    /// # Errors
    ///
    /// Fails with an `InitializationError` if the OS rejects a handler
    /// registration (for example for SIGKILL) or the listener thread cannot
    /// be spawned.
    pub fn install(&self, signals: &[Signal]) -> Result<()> {
        let mut guard = self
            .installed
            .lock()
            .map_err(|_| CoreError::Other("Signal router installation lock poisoned".to_string()))?;

        // Tear the old installation down first so a signal is never handled
        // twice during the swap
        if let Some(previous) = guard.take() {
            shutdown_installation(previous);
        }

        let raw: Vec<i32> = signals.iter().map(|s| *s as i32).collect();
        let mut info = SignalsInfo::<WithOrigin>::new(&raw).map_err(|e| {
            CoreError::InitializationError(format!("Failed to install signal handlers: {e}"))
        })?;
        let handle = info.handle();

        let (origin_tx, origin_rx) = mpsc::unbounded_channel::<SignalOrigin>();
        let listener = std::thread::Builder::new()
            .name("muster-signals".to_string())
            .spawn(move || {
                for origin in info.forever() {
                    let delivered = SignalOrigin {
                        signal: origin.signal,
                        origin_pid: origin.process.map(|p| p.pid as u32),
                    };
                    if origin_tx.send(delivered).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| {
                CoreError::InitializationError(format!("Failed to spawn signal thread: {e}"))
            })?;

        let control = tokio::spawn(control_loop(
            origin_rx,
            self.policy.clone(),
            Arc::clone(&self.groups),
            self.secondary_signal,
            self.reraise,
            self.notify_tx.clone(),
        ));

        info!(
            "Signal router installed for {:?}",
            signals.iter().map(|s| s.as_str()).collect::<Vec<_>>()
        );
        *guard = Some(Installation {
            handle,
            listener,
            control,
            signals: signals.to_vec(),
        });
        Ok(())
    }

    /// Remove installed handlers, restoring default dispositions
    pub fn uninstall(&self) -> Result<()> {
        let mut guard = self
            .installed
            .lock()
            .map_err(|_| CoreError::Other("Signal router installation lock poisoned".to_string()))?;
        if let Some(installation) = guard.take() {
            shutdown_installation(installation);
            info!("Signal router uninstalled");
        }
        Ok(())
    }

    /// The currently installed signal set, empty when not installed
    pub fn installed_signals(&self) -> Vec<Signal> {
        self.installed
            .lock()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|installation| installation.signals.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Whether a handler installation is active
    pub fn is_installed(&self) -> bool {
        !self.installed_signals().is_empty()
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.installed.lock() {
            if let Some(installation) = guard.take() {
                shutdown_installation(installation);
            }
        }
    }
}

fn shutdown_installation(installation: Installation) {
    installation.handle.close();
    if installation.listener.join().is_err() {
        warn!("Signal listener thread panicked");
    }
    // The listener dropped its sender, so the control task drains and ends
    // on its own; aborting just makes that prompt
    installation.control.abort();
}

async fn control_loop(
    mut origin_rx: mpsc::UnboundedReceiver<SignalOrigin>,
    policy: PolicyCell,
    groups: Arc<Mutex<Vec<Arc<dyn ProcessGroup>>>>,
    secondary_signal: Signal,
    reraise: bool,
    notify_tx: broadcast::Sender<RouterEvent>,
) {
    while let Some(origin) = origin_rx.recv().await {
        let active_policy = policy.current().await;
        let _ = notify_tx.send(RouterEvent::Received {
            signal: origin.signal,
            origin_pid: origin.origin_pid,
        });
        info!(
            "Received {} (origin pid {:?})",
            describe_signal(origin.signal),
            origin.origin_pid
        );

        let snapshot: Vec<Arc<dyn ProcessGroup>> = groups.lock().await.clone();

        if origin.signal == secondary_signal as i32 && active_policy.handle_secondary_signal {
            handle_secondary(&snapshot, &origin, secondary_signal, &notify_tx).await;
            // A handled secondary signal never kills the launcher
            continue;
        }

        // Forward to the children before the launcher's own shutdown begins
        if active_policy.forward_signals {
            if let Ok(signal) = Signal::try_from(origin.signal) {
                let mut pids = Vec::new();
                for group in &snapshot {
                    match group.forward_signal(signal).await {
                        Ok(mut delivered) => pids.append(&mut delivered),
                        Err(e) => warn!(
                            "Failed to forward {} to group '{}': {}",
                            signal,
                            group.name(),
                            e
                        ),
                    }
                }
                let _ = notify_tx.send(RouterEvent::Forwarded {
                    signal: origin.signal,
                    pids,
                });
            }
        }

        for group in &snapshot {
            if let Err(e) = group.close().await {
                error!("Failed to close group '{}': {}", group.name(), e);
            }
        }
        let _ = notify_tx.send(RouterEvent::Closed {
            signal: origin.signal,
        });

        if reraise {
            // Die of the signal with its default behavior so the launcher's
            // own exit status reflects what happened
            if let Err(e) = low_level::emulate_default_handler(origin.signal) {
                warn!(
                    "Failed to re-raise {}: {}",
                    describe_signal(origin.signal),
                    e
                );
            }
        }
    }
}

/// Attribute a secondary signal to the worker that raised it and close the
/// owning group. Without a usable origin, fall back to closing everything.
async fn handle_secondary(
    snapshot: &[Arc<dyn ProcessGroup>],
    origin: &SignalOrigin,
    secondary_signal: Signal,
    notify_tx: &broadcast::Sender<RouterEvent>,
) {
    let mut owner: Option<Arc<dyn ProcessGroup>> = None;

    if let Some(pid) = origin.origin_pid {
        for group in snapshot {
            match group.fail_rank_by_pid(pid, secondary_signal).await {
                Ok(Some(rank)) => {
                    warn!(
                        "Worker pid {} (rank {} of group '{}') reported failure via {}",
                        pid,
                        rank,
                        group.name(),
                        secondary_signal
                    );
                    let _ = notify_tx.send(RouterEvent::SecondaryAttributed {
                        group: group.name().to_string(),
                        rank,
                        origin_pid: pid,
                    });
                    owner = Some(Arc::clone(group));
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Failed to attribute pid {} in group '{}': {}",
                    pid,
                    group.name(),
                    e
                ),
            }
        }
        if owner.is_none() {
            warn!(
                "{} from pid {} does not belong to any attached group; closing every group",
                secondary_signal, pid
            );
        }
    } else {
        warn!(
            "{} arrived without origin information; closing every group",
            secondary_signal
        );
    }

    match owner {
        Some(group) => {
            if let Err(e) = group.close().await {
                error!("Failed to close group '{}': {}", group.name(), e);
            }
        }
        None => {
            for group in snapshot {
                if let Err(e) = group.close().await {
                    error!("Failed to close group '{}': {}", group.name(), e);
                }
            }
        }
    }
    let _ = notify_tx.send(RouterEvent::Closed {
        signal: secondary_signal as i32,
    });
}

fn describe_signal(signo: i32) -> String {
    crate::group::signal_name(signo).unwrap_or_else(|| format!("signal {signo}"))
}
