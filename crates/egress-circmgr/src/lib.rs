//! `egress-circmgr`: rate-limited egress circuits on demand.
//!
//! # Overview
//!
//! This crate multiplexes outbound traffic across a pool of proxy routes
//! ("circuits"): ordinary HTTP(S) proxies, SOCKS5 proxies, and circuits
//! routed through a locally supervised onion-routing daemon.  Its job is
//! to keep every exit IP under a configured number of actions within a
//! rolling window, to rotate exits when a limit is hit or an exit
//! misbehaves, and to attribute actions to whichever IP a route happens to
//! be presenting at the time.
//!
//! The entry point is [`EgressMgr`]: register actions and circuits with
//! it, then hand out [`EgressClient`]s.  Before performing a rate-limited
//! action, a caller asks its client to
//! [`probe_or_change`](EgressClient::probe_or_change); after performing
//! one, it calls [`report_action`](EgressClient::report_action).
//! Everything else (polling each circuit's exit IP, healing circuit
//! health, restarting the daemon, persisting the usage cache) happens in
//! the background.
//!
//! # Limitations
//!
//! There is no coordination across processes: two managers pointed at the
//! same proxies will each enforce their own limits.  Rate counts are
//! deliberately imprecise around IP changes; actions that race a change
//! are counted against both the old and the new exit.

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

mod circuit;
mod client;
mod config;
mod err;
mod mgr;
mod poll;
mod pool;
mod request;

pub use circuit::{Circuit, CircuitKind, HEALTHY_THRESHOLD, HEALTH_MAX};
pub use client::{ClientSpec, EgressClient};
pub use config::{
    CircuitConfig, CircuitConfigBuilder, CircuitConfigBuilderError, MgrConfig, MgrConfigBuilder,
    MgrConfigBuilderError, ProxyProtocol, DEFAULT_DAEMON_POLL_INTERVAL, DEFAULT_HEAL_AMOUNT,
    DEFAULT_HEAL_INTERVAL, DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_URL,
};
pub use err::{Error, ErrorKind, HasKind};
pub use mgr::{EgressMgr, MAX_CHANGE_TRIES};
pub use request::{
    classify_error, retry_directive, ErrorClass, HttpIpProbe, IpProbe, ProxyConnection,
    RetryDirective, SocksOptions,
};

// The daemon-supervision seam, re-exported so embedders can build a
// manager without naming the sibling crate.
pub use egress_daemon::{DaemonSupervisor, ProcessHost};
#[cfg(unix)]
pub use egress_daemon::SystemHost;

/// A Result type as returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;
