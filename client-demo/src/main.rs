//! A minimal client for the egress circuit manager: bind one circuit,
//! register one action, and run a probe-report cycle through it.

#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use tracing::info;

use egress_circmgr::{
    CircuitConfig, ClientSpec, DaemonSupervisor, EgressMgr, HttpIpProbe, MgrConfig, SystemHost,
    DEFAULT_PROBE_URL,
};

#[derive(FromArgs)]
/// Send a rate-limited action through a SOCKS proxy, rotating the exit
/// when its budget runs out.
///
/// This is a demo; you get no stability guarantee.
struct Args {
    /// host of the SOCKS proxy to route through.
    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    socks_host: String,
    /// port of the SOCKS proxy.
    #[argh(option, default = "9050")]
    socks_port: u16,
    /// treat the proxy as the locally supervised tor daemon.
    #[argh(switch)]
    local_daemon: bool,
    /// IP-echo URL fetched through the circuit to learn its exit IP.
    #[argh(option, default = "String::from(DEFAULT_PROBE_URL)")]
    probe_url: String,
    /// name of the demo action.
    #[argh(option, default = "String::from(\"api\")")]
    action: String,
    /// how many actions each exit IP may carry per 24 h window.
    #[argh(option, default = "25")]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let supervisor = DaemonSupervisor::new(SystemHost::new());
    let probe = Arc::new(HttpIpProbe::new(&args.probe_url));
    let mgr = EgressMgr::new(supervisor, probe, MgrConfig::default());
    mgr.register_action(&args.action, args.limit, None);

    let circuit = CircuitConfig::builder()
        .host(args.socks_host)
        .port(args.socks_port)
        .is_local_daemon(args.local_daemon)
        .build()?;
    mgr.add_circuit(circuit).await?;

    let client = mgr.create_client(ClientSpec::Any)?;
    info!(
        "bound to {}; exit IP is {:?}",
        client.circuit().display_id(),
        client.current_ip()
    );

    if client.probe_or_change(&args.action).await? {
        info!(
            "exit was exhausted; now presenting {:?}",
            client.current_ip()
        );
    }
    client.report_action(&args.action)?;
    info!(
        "recorded one {:?} action against {:?}",
        args.action,
        client.current_ip()
    );

    mgr.snapshot_rate_cache()?;
    Ok(())
}
