//! `egress-daemon`: lifecycle control for a locally managed
//! onion-routing daemon.
//!
//! The egress manager can route some of its circuits through a daemon (by
//! default, `tor`) running on the local machine.  That daemon is a
//! process-wide singleton resource: this crate owns finding it, starting
//! it, asking it to pick a new exit, and tearing it down.
//!
//! Process supervision is the least portable part of the system, so the
//! actual OS interaction is behind the small [`ProcessHost`] trait
//! ({list, start, signal}); tests and alternate daemons substitute their
//! own implementation.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Wrapper type for Results returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Executable name of the daemon we supervise.
pub const DEFAULT_DAEMON_COMMAND: &str = "tor";

/// Arguments that tell the daemon to detach and run in the background.
///
/// Because the daemon forks itself, our direct child exits promptly and the
/// daemon survives the supervising process.
pub const RUN_AS_DAEMON_ARGS: &[&str] = &["--RunAsDaemon", "1"];

/// Fixed delay after spawning the daemon before it is assumed usable.
/// There is no readiness probe.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(5);

/// How long to wait after delivering the reconfigure signal.  The daemon is
/// expected to *survive* it, so running out this wait is the success path.
pub const DEFAULT_SIGNAL_WAIT: Duration = Duration::from_secs(1);

/// How long to wait for a process to exit after the terminate signal.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A signal the supervisor can deliver, independent of the OS encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DaemonSignal {
    /// "Reload your configuration / pick a new exit" (SIGHUP).
    Reconfigure,
    /// "Shut down" (SIGTERM).
    Terminate,
}

/// What a process did in response to a signal, within the wait budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignalOutcome {
    /// The process exited before the wait ran out.
    Exited,
    /// The process was still running when the wait ran out.
    StillRunning,
}

/// Minimal view of the OS needed to supervise the daemon.
///
/// Implementations must be cheap to call repeatedly; the manager consults
/// `list` on every rotation and restart.
#[async_trait]
pub trait ProcessHost: Send + Sync + 'static {
    /// Return the PIDs of every running process whose command matches
    /// `comm`.
    async fn list(&self, comm: &str) -> Result<Vec<u32>>;

    /// Spawn `cmd` with `args`, detached from this process.
    async fn start_detached(&self, cmd: &str, args: &[&str]) -> Result<()>;

    /// Deliver `signal` to `pid`, then wait up to `wait` to see whether the
    /// process exits.
    async fn signal_and_wait(
        &self,
        pid: u32,
        signal: DaemonSignal,
        wait: Duration,
    ) -> Result<SignalOutcome>;
}

/// Supervisor for the local onion-routing daemon.
///
/// This type owns only the *process* side of the daemon: scanning, spawning,
/// signalling.  The decision of when a restart is warranted, and the gating
/// of concurrent restarts, belong to the egress manager.
pub struct DaemonSupervisor<H: ProcessHost> {
    /// OS access (or a test double).
    host: H,
    /// Executable name to scan for and spawn.
    command: String,
    /// How long to sleep after spawning before the daemon is assumed up.
    startup_grace: Duration,
    /// Wait budget for the reconfigure signal.
    signal_wait: Duration,
}

impl<H: ProcessHost> DaemonSupervisor<H> {
    /// Create a supervisor for the default daemon command.
    pub fn new(host: H) -> Self {
        DaemonSupervisor {
            host,
            command: DEFAULT_DAEMON_COMMAND.to_owned(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            signal_wait: DEFAULT_SIGNAL_WAIT,
        }
    }

    /// Replace the daemon command (for alternate daemons).
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_owned();
        self
    }

    /// Replace the startup grace period (tests use zero).
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Replace the signal wait budget (tests use zero).
    pub fn with_signal_wait(mut self, wait: Duration) -> Self {
        self.signal_wait = wait;
        self
    }

    /// Return a reference to the underlying host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Start the daemon unless it is already running.
    ///
    /// Returns true if the daemon was already running, false if we spawned
    /// it.  After a spawn, blocks for the startup grace period.
    pub async fn start_if_not_running(&self) -> Result<bool> {
        let pids = self.host.list(&self.command).await?;
        if !pids.is_empty() {
            debug!("{} already running (pids {:?})", self.command, pids);
            return Ok(true);
        }
        info!("{} is not running; starting it", self.command);
        self.host
            .start_detached(&self.command, RUN_AS_DAEMON_ARGS)
            .await?;
        tokio::time::sleep(self.startup_grace).await;
        Ok(false)
    }

    /// Ask every running daemon process to pick a new exit, by delivering
    /// the reconfigure signal.
    ///
    /// The daemon must stay up through this: a process that exits in
    /// response is broken, and reported as [`Error::DaemonDied`].
    pub async fn rotate_exit(&self) -> Result<()> {
        let pids = self.host.list(&self.command).await?;
        if pids.is_empty() {
            warn!("asked to rotate the {} exit, but none is running", self.command);
            return Ok(());
        }
        for pid in pids {
            debug!("delivering reconfigure signal to {} (pid {})", self.command, pid);
            match self
                .host
                .signal_and_wait(pid, DaemonSignal::Reconfigure, self.signal_wait)
                .await?
            {
                SignalOutcome::StillRunning => {}
                SignalOutcome::Exited => return Err(Error::DaemonDied { pid }),
            }
        }
        Ok(())
    }

    /// Terminate every running daemon process, awaiting each.
    ///
    /// Finding none is benign: the daemon may have been stopped externally.
    pub async fn kill_all(&self) -> Result<()> {
        let pids = self.host.list(&self.command).await?;
        if pids.is_empty() {
            warn!("asked to kill {}, but none is running", self.command);
            return Ok(());
        }
        for pid in pids {
            info!("terminating {} (pid {})", self.command, pid);
            match self
                .host
                .signal_and_wait(pid, DaemonSignal::Terminate, KILL_WAIT)
                .await?
            {
                SignalOutcome::Exited => {}
                SignalOutcome::StillRunning => {
                    warn!("{} (pid {}) did not exit within {:?}", self.command, pid, KILL_WAIT);
                }
            }
        }
        Ok(())
    }
}

/// An error from daemon supervision.
///
/// Everything here is fatal to the operation that hit it: if we cannot see
/// or control the daemon process, the egress manager cannot make progress
/// on onion-routed circuits.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Could not spawn the daemon executable.
    #[error("could not spawn {cmd:?}")]
    Spawn {
        /// The command we tried to run.
        cmd: String,
        /// The underlying error.
        #[source]
        cause: Arc<std::io::Error>,
    },

    /// Signal delivery failed for a reason other than "no such process".
    #[error("could not signal pid {pid}")]
    Signal {
        /// The process we tried to signal.
        pid: u32,
        /// OS error string (kept as a string so this error stays portable
        /// and Clone).
        detail: String,
    },

    /// A daemon process exited in response to the reconfigure signal.
    #[error("daemon pid {pid} died on reconfigure; it should have stayed up")]
    DaemonDied {
        /// The process that died.
        pid: u32,
    },
}

#[cfg(unix)]
pub use system::SystemHost;

/// Real-OS implementation of [`ProcessHost`].
#[cfg(unix)]
mod system {
    use super::{DaemonSignal, Error, ProcessHost, Result, SignalOutcome};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use sysinfo::{PidExt, ProcessExt, System, SystemExt};
    use tracing::debug;

    /// Poll interval while waiting for a signalled process to exit.
    const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// [`ProcessHost`] backed by the actual operating system.
    #[derive(Debug, Default, Clone)]
    #[non_exhaustive]
    pub struct SystemHost;

    impl SystemHost {
        /// Create a new `SystemHost`.
        pub fn new() -> Self {
            SystemHost
        }
    }

    /// Return true if `pid` currently names a live process.
    fn pid_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0: existence check only.
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::ESRCH) => false,
            // EPERM etc.: it exists, we just can't touch it.
            Err(_) => true,
        }
    }

    #[async_trait]
    impl ProcessHost for SystemHost {
        async fn list(&self, comm: &str) -> Result<Vec<u32>> {
            let comm_owned = comm.to_owned();
            // sysinfo's scan is synchronous and not instant; keep it off the
            // async workers.
            let pids = tokio::task::spawn_blocking(move || {
                let sys = System::new_all();
                sys.processes_by_exact_name(&comm_owned)
                    .map(|p| p.pid().as_u32())
                    .collect::<Vec<u32>>()
            })
            .await
            .unwrap_or_default();
            debug!("process scan for {:?}: {:?}", comm, pids);
            Ok(pids)
        }

        async fn start_detached(&self, cmd: &str, args: &[&str]) -> Result<()> {
            let mut child = tokio::process::Command::new(cmd)
                .args(args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map_err(|e| Error::Spawn {
                    cmd: cmd.to_owned(),
                    cause: Arc::new(e),
                })?;
            // The daemon forks itself away; reap the short-lived direct
            // child so it does not linger as a zombie.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(())
        }

        async fn signal_and_wait(
            &self,
            pid: u32,
            signal: DaemonSignal,
            wait: Duration,
        ) -> Result<SignalOutcome> {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let sig = match signal {
                DaemonSignal::Reconfigure => Signal::SIGHUP,
                DaemonSignal::Terminate => Signal::SIGTERM,
            };
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => return Ok(SignalOutcome::Exited),
                Err(e) => {
                    return Err(Error::Signal {
                        pid,
                        detail: e.to_string(),
                    })
                }
            }
            let deadline = tokio::time::Instant::now() + wait;
            while tokio::time::Instant::now() < deadline {
                if !pid_alive(pid) {
                    return Ok(SignalOutcome::Exited);
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            if pid_alive(pid) {
                Ok(SignalOutcome::StillRunning)
            } else {
                Ok(SignalOutcome::Exited)
            }
        }
    }
}
