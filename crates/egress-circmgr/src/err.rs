//! Declare an error type for the `egress-circmgr` crate.

use derive_more::Display;

/// Classification of an error arising from egress management.
///
/// Most embedding applications only need the kind: configuration and
/// resource-exhaustion errors should normally terminate the process (the
/// former are programmer errors, the latter mean the pool cannot make
/// forward progress), while transient I/O is recovered by the request
/// adapter and should never reach a caller at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A caller misused the API or supplied an impossible configuration.
    #[display(fmt = "configuration or API misuse")]
    Configuration,

    /// The pool has no way to make forward progress.
    #[display(fmt = "egress pool exhausted")]
    ResourceExhaustion,

    /// A network operation failed in a way that is worth retrying.
    #[display(fmt = "transient network failure")]
    TransientIo,

    /// We could not observe or control the local daemon process.
    #[display(fmt = "daemon control failure")]
    DaemonIo,

    /// The persistent rate cache was unreadable or unwritable.
    #[display(fmt = "rate cache persistence problem")]
    Persistence,

    /// Internal error (bug) in this crate.
    #[display(fmt = "internal error (bug)")]
    Internal,
}

/// Errors that can be categorized as belonging to an [`ErrorKind`].
pub trait HasKind {
    /// Return the kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// An error originating from the egress circuit manager.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Tried to add a circuit whose identifier is already present.
    #[error("circuit {0:?} is already registered")]
    DuplicateCircuit(String),

    /// Tried to add a non-cycling circuit with no name.
    ///
    /// A circuit outside the cycling pool can only ever be reached by
    /// name, so a nameless one would be unreachable.
    #[error("a circuit outside the cycling pool must have a name")]
    UnnamedRigidCircuit,

    /// Client-spec resolution found no matching circuit.
    #[error("no circuit matched the requested specification")]
    NoCircuitFound,

    /// A rate-limited operation was attempted on a polling or rigid
    /// client that cannot participate in rotation.
    #[error("operation not supported on a rigid or polling client")]
    RigidCircuitMisuse,

    /// Every circuit in the cycling pool is unhealthy.
    #[error("every circuit in the cycling pool is unhealthy")]
    AllCircuitsUnhealthy,

    /// We rotated the daemon's exit repeatedly and never observed a new
    /// IP.
    #[error("gave up changing exit IP after {tries} attempts")]
    IpChangeExhausted {
        /// How many rotate-and-probe rounds we tried.
        tries: u32,
    },

    /// `on_changed_ip` was invoked without a usable IP.
    #[error("an IP change completed without an IP")]
    MissingIp,

    /// An exit-IP probe failed.
    #[error("could not discover exit IP: {detail}")]
    Probe {
        /// Human-readable description of what went wrong.
        detail: String,
    },

    /// Error from the rate store.
    #[error("rate accounting error")]
    Rate(#[from] egress_rate::Error),

    /// Error from daemon supervision.
    #[error("daemon supervision error")]
    Daemon(#[from] egress_daemon::Error),

    /// The manager this handle belonged to no longer exists.
    #[error("egress manager has been dropped")]
    MgrGone,
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::DuplicateCircuit(_)
            | E::UnnamedRigidCircuit
            | E::NoCircuitFound
            | E::RigidCircuitMisuse => EK::Configuration,
            E::AllCircuitsUnhealthy | E::IpChangeExhausted { .. } => EK::ResourceExhaustion,
            E::MissingIp => EK::Internal,
            E::Probe { .. } => EK::TransientIo,
            E::Rate(e) => match e {
                egress_rate::Error::UnknownAction(_) => EK::Configuration,
                _ => EK::Persistence,
            },
            E::Daemon(_) => EK::DaemonIo,
            E::MgrGone => EK::Internal,
        }
    }
}
