//! The egress manager: the single-flight arbiter that ties together the
//! circuit pool, the rate store, the pollers, and the daemon supervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use egress_daemon::{DaemonSupervisor, ProcessHost};
use egress_rate::{now_ms, RateStore};
use futures::channel::oneshot;
use tracing::{debug, error, info, warn};

use crate::circuit::{Circuit, CircuitKind};
use crate::client::{ClientFlavor, ClientSpec, EgressClient};
use crate::config::{CircuitConfig, MgrConfig};
use crate::pool::CircuitPool;
use crate::request::{probe_with_retries, IpProbe};
use crate::{Error, Result};

/// How many rotate-then-probe rounds a definitive IP change gets before we
/// declare the pool stuck.
pub const MAX_CHANGE_TRIES: u32 = 7;

/// How many probe attempts a freshly added circuit gets while learning its
/// exit IP.
const ADD_PROBE_ATTEMPTS: u32 = 3;

/// Gate state: whether an IP change (or a daemon restart) is in flight,
/// and who is waiting for it to finish.
///
/// These are conceptually process-wide flags, but they live here on the
/// manager instance so that independent managers do not interfere.
#[derive(Default)]
struct GateState {
    /// True while an IP change is in flight.
    changing: bool,
    /// True while the daemon is being killed and respawned.
    restarting: bool,
    /// Pending completions, released FIFO when the in-flight change ends.
    /// Each is signaled exactly once with "did an IP change happen".
    waiters: Vec<oneshot::Sender<bool>>,
}

/// Callback invoked when every cycling circuit is unhealthy.
type AllUnhealthyHook = Box<dyn Fn() + Send + Sync>;

/// Coordinator for a pool of rate-limited egress circuits.
///
/// One manager owns everything: the circuits, their pollers and pollster
/// clients, the user clients, the rate store, and the daemon supervisor.
/// All IP changes funnel through its gates, so at most one change is in
/// flight at a time; callers that arrive during a change wait on the
/// waiter queue and complete as if they had driven the change themselves.
pub struct EgressMgr<H: ProcessHost> {
    /// Supervisor for the local onion-routing daemon.
    supervisor: DaemonSupervisor<H>,
    /// Exit-IP discovery.
    probe: Arc<dyn IpProbe>,
    /// Manager-level settings.
    config: MgrConfig,
    /// The live circuits.
    pool: Mutex<CircuitPool>,
    /// Per-IP usage accounting.
    rate: Mutex<RateStore>,
    /// The "changing"/"restarting" gates and waiter queue.
    gate: Mutex<GateState>,
    /// Every user client we have handed out.  Pollster clients are not
    /// tracked here.
    clients: Mutex<Vec<Arc<EgressClient<H>>>>,
    /// Serializes `add_circuit` calls.
    add_lock: tokio::sync::Mutex<()>,
    /// Overridable reaction to a fully unhealthy pool.
    all_unhealthy_hook: Mutex<Option<AllUnhealthyHook>>,
}

impl<H: ProcessHost> EgressMgr<H> {
    /// Create a manager.  Any rate cache left by a previous run is loaded
    /// from the configured cache path.
    pub fn new(supervisor: DaemonSupervisor<H>, probe: Arc<dyn IpProbe>, config: MgrConfig) -> Arc<Self> {
        let mut rate = RateStore::new();
        rate.load(&config.cache_path);
        Arc::new(EgressMgr {
            supervisor,
            probe,
            config,
            pool: Mutex::new(CircuitPool::default()),
            rate: Mutex::new(rate),
            gate: Mutex::new(GateState::default()),
            clients: Mutex::new(Vec::new()),
            add_lock: tokio::sync::Mutex::new(()),
            all_unhealthy_hook: Mutex::new(None),
        })
    }

    /// Register (or re-register) a named action with its limit and rolling
    /// window.  A `None` window gets the 24 h default.
    pub fn register_action(&self, name: &str, limit: u32, window: Option<Duration>) {
        self.rate
            .lock()
            .expect("poisoned lock")
            .register_action(name, limit, window);
    }

    /// Add an exit IP to the blacklist.
    pub fn blacklist_ip(&self, ip: &str) {
        self.rate.lock().expect("poisoned lock").blacklist_ip(ip);
    }

    /// Install a handler to run when every cycling circuit is unhealthy.
    ///
    /// Without one, the condition is logged and the triggering operation
    /// fails with [`Error::AllCircuitsUnhealthy`] (which callers should
    /// treat as fatal).
    pub fn set_all_unhealthy_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.all_unhealthy_hook.lock().expect("poisoned lock") = Some(Box::new(hook));
    }

    /// Validate, probe, and register a new circuit, then launch its
    /// background tasks.
    ///
    /// Adds are serialized; this operation is not reentrant per-circuit.
    pub async fn add_circuit(self: &Arc<Self>, config: CircuitConfig) -> Result<Arc<Circuit>> {
        let _serialized = self.add_lock.lock().await;
        let circuit = Arc::new(Circuit::new(config));
        self.pool
            .lock()
            .expect("poisoned lock")
            .check_unique(&circuit)?;
        if circuit.is_local_daemon() {
            self.supervisor.start_if_not_running().await?;
        }
        let ip =
            probe_with_retries(self.probe.as_ref(), &circuit.connection(), ADD_PROBE_ATTEMPTS)
                .await?;
        self.on_changed_ip(&circuit, &ip)?;
        self.pool
            .lock()
            .expect("poisoned lock")
            .add(Arc::clone(&circuit))?;
        crate::poll::launch_circuit_tasks(self, &circuit);
        info!("added circuit {} (exit {})", circuit.display_id(), ip);
        Ok(circuit)
    }

    /// Invalidate and drop a circuit, rebinding every user client bound to
    /// it.  When the last daemon-routed circuit goes, the daemon goes with
    /// it.
    pub async fn remove_circuit(&self, circuit: &Arc<Circuit>) -> Result<()> {
        self.pool.lock().expect("poisoned lock").remove(circuit);
        info!("removed circuit {}", circuit.display_id());

        let bound: Vec<Arc<EgressClient<H>>> = self
            .clients
            .lock()
            .expect("poisoned lock")
            .iter()
            .filter(|cl| Arc::ptr_eq(&cl.circuit(), circuit))
            .map(Arc::clone)
            .collect();
        for client in bound {
            match self.select_replacement(Some(circuit))? {
                Some(fresh) => client.rebind(fresh),
                None => warn!(
                    "no circuit left to rebind a client of {}",
                    circuit.display_id()
                ),
            }
        }

        if circuit.is_local_daemon()
            && self
                .pool
                .lock()
                .expect("poisoned lock")
                .local_daemon_circuits()
                .is_empty()
        {
            self.supervisor.kill_all().await?;
        }
        Ok(())
    }

    /// Create a user client bound to the circuit `spec` resolves to.
    pub fn create_client(self: &Arc<Self>, spec: ClientSpec) -> Result<Arc<EgressClient<H>>> {
        let circuit = match spec {
            ClientSpec::Any => self.select_replacement(None)?,
            ClientSpec::Index(i) => self.pool.lock().expect("poisoned lock").by_index(i),
            ClientSpec::Named(ref name) => self.pool.lock().expect("poisoned lock").by_name(name),
        }
        .ok_or(Error::NoCircuitFound)?;
        let client = Arc::new(EgressClient::new(
            Arc::downgrade(self),
            circuit,
            ClientFlavor::User,
        ));
        self.clients
            .lock()
            .expect("poisoned lock")
            .push(Arc::clone(&client));
        Ok(client)
    }

    /// Record one `action` against whatever exit IP `circuit` is
    /// presenting right now.
    ///
    /// This is deliberately not gated on an in-flight change: an action
    /// racing a change lands on the old or the new IP, and the
    /// ambiguous-window copy in [`on_observed_ip_change`] makes that safe.
    /// If the exit IP is momentarily unset, the action is recorded under
    /// the empty IP key, which is initialized like any other.
    ///
    /// [`on_observed_ip_change`]: Self::on_observed_ip_change
    pub fn report_action(&self, action: &str, circuit: &Arc<Circuit>) -> Result<()> {
        let ip = circuit.exit_ip().unwrap_or_default();
        let mut rate = self.rate.lock().expect("poisoned lock");
        rate.touch(&ip);
        rate.record(&ip, action, now_ms())?;
        Ok(())
    }

    /// Number of recorded timestamps for (`ip`, `action`).  Observability
    /// helper; does not preen.
    pub fn rate_count(&self, ip: &str, action: &str) -> usize {
        self.rate.lock().expect("poisoned lock").count(ip, action)
    }

    /// If the current exit has budget left for `action`, do nothing and
    /// return false; otherwise drive (or join) an IP change and return
    /// true.
    pub(crate) async fn probe_or_change(
        &self,
        client: &EgressClient<H>,
        action: &str,
    ) -> Result<bool> {
        if let Some(rx) = self.join_if_changing() {
            return Ok(rx.await.unwrap_or(false));
        }
        let circuit = client.circuit();
        let ip = circuit.exit_ip().unwrap_or_default();
        let available = self
            .rate
            .lock()
            .expect("poisoned lock")
            .is_available(&ip, action, now_ms())?;
        if available {
            return Ok(false);
        }
        info!("exit {} is exhausted for {:?}; changing", ip, action);
        self.force_change(client).await
    }

    /// Unconditionally drive (or join) an exit change for `client`,
    /// dispatched on its circuit's kind.
    pub(crate) async fn force_change(&self, client: &EgressClient<H>) -> Result<bool> {
        if let Some(rx) = self.join_if_changing() {
            return Ok(rx.await.unwrap_or(false));
        }
        let circuit = client.circuit();
        match circuit.kind() {
            CircuitKind::LocalDaemon => {
                self.definitively_change_to_available_ip(&circuit).await?;
                Ok(true)
            }
            CircuitKind::Cycling => match self.select_replacement(Some(&circuit))? {
                Some(fresh) => {
                    client.rebind(fresh);
                    Ok(true)
                }
                None => {
                    warn!(
                        "nowhere to rotate to from {}; staying put",
                        circuit.display_id()
                    );
                    Ok(false)
                }
            },
            CircuitKind::Rigid => {
                info!(
                    "circuit {} is rigid by configuration; leaving its exit alone",
                    circuit.display_id()
                );
                Ok(false)
            }
        }
    }

    /// Rotate the daemon's exit until the observed IP differs from the one
    /// we started with, then record it.
    ///
    /// Single-flight: if a change is already in flight we join it instead.
    /// Running out of attempts means the daemon is stuck, which the caller
    /// should treat as fatal.  Note that the *new* IP may itself turn out
    /// to be exhausted for some action; the next `probe_or_change` call
    /// handles that by driving a further change.
    async fn definitively_change_to_available_ip(&self, circuit: &Arc<Circuit>) -> Result<()> {
        if let Some(rx) = self.begin_change() {
            let _ = rx.await;
            return Ok(());
        }
        let result = self.drive_exit_rotation(circuit).await;
        if let Err(ref e) = result {
            error!("definitive IP change failed: {}", e);
            self.release_waiters(false);
        }
        result
    }

    /// The rotate-then-probe retry loop behind a definitive change.
    async fn drive_exit_rotation(&self, circuit: &Arc<Circuit>) -> Result<()> {
        let pre_change = circuit.exit_ip();
        for attempt in 1..=MAX_CHANGE_TRIES {
            self.supervisor.rotate_exit().await?;
            match self.probe.external_ip(&circuit.connection()).await {
                Ok(ip) if pre_change.as_deref() != Some(ip.as_str()) => {
                    debug!(
                        "exit rotation landed on {} after {} attempt(s)",
                        ip, attempt
                    );
                    return self.on_changed_ip(circuit, &ip);
                }
                Ok(ip) => debug!(
                    "rotation attempt {}/{} still presents {}",
                    attempt, MAX_CHANGE_TRIES, ip
                ),
                Err(e) => warn!(
                    "probe after rotation attempt {}/{} failed: {}",
                    attempt, MAX_CHANGE_TRIES, e
                ),
            }
        }
        Err(Error::IpChangeExhausted {
            tries: MAX_CHANGE_TRIES,
        })
    }

    /// A poller observed `circuit` presenting `new_ip` without any change
    /// having been requested.
    ///
    /// Actions reported since the circuit's last poll may have gone out
    /// through either exit, so their timestamps are copied onto the new IP
    /// as well (double-counting in that narrow window is the safe
    /// direction).  The rate cache is persisted here, and only here, to
    /// bound data loss without per-action write amplification.
    pub(crate) fn on_observed_ip_change(&self, circuit: &Arc<Circuit>, new_ip: &str) -> Result<()> {
        self.gate.lock().expect("poisoned lock").changing = true;
        let old_ip = circuit.exit_ip().unwrap_or_default();
        let last_poll = circuit.last_poll_ms();
        debug!(
            "unrequested IP change on {}: {} -> {}",
            circuit.display_id(),
            old_ip,
            new_ip
        );
        {
            let mut rate = self.rate.lock().expect("poisoned lock");
            rate.touch(new_ip);
            rate.copy_ambiguous(&old_ip, new_ip, last_poll);
            if let Err(e) = rate.save(&self.config.cache_path) {
                warn!("could not persist rate cache: {}", e);
            }
        }
        let result = self.on_changed_ip(circuit, new_ip);
        if result.is_err() {
            self.release_waiters(false);
        }
        result
    }

    /// Complete an IP change: record the new IP on the circuit, clear the
    /// gates, compact the rate store if it has grown past its threshold,
    /// and release every waiter (FIFO) with "changed".
    pub(crate) fn on_changed_ip(&self, circuit: &Arc<Circuit>, new_ip: &str) -> Result<()> {
        if new_ip.is_empty() {
            return Err(Error::MissingIp);
        }
        circuit.set_exit_ip(new_ip);
        circuit.stamp_poll(now_ms());
        {
            let keep = self.pool.lock().expect("poisoned lock").active_ips();
            let mut rate = self.rate.lock().expect("poisoned lock");
            if rate.needs_compact() {
                rate.compact(now_ms(), &keep);
            }
        }
        self.release_waiters(true);
        Ok(())
    }

    /// Kill and respawn the daemon, then re-learn the exit IP of every
    /// daemon-routed circuit.
    ///
    /// Single-flight with its own `restarting` gate: callers that arrive
    /// mid-restart wait it out and return as if they had driven it.
    pub async fn force_restart(&self) -> Result<()> {
        let join = {
            let mut gate = self.gate.lock().expect("poisoned lock");
            if gate.restarting {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push(tx);
                Some(rx)
            } else {
                gate.restarting = true;
                gate.changing = true;
                None
            }
        };
        if let Some(rx) = join {
            let _ = rx.await;
            return Ok(());
        }
        let result = self.restart_and_reabsorb().await;
        if result.is_err() {
            self.release_waiters(false);
        }
        result
    }

    /// The body of a forced restart.
    async fn restart_and_reabsorb(&self) -> Result<()> {
        info!("force-restarting the local daemon");
        self.supervisor.kill_all().await?;
        self.supervisor.start_if_not_running().await?;
        let circuits = self
            .pool
            .lock()
            .expect("poisoned lock")
            .local_daemon_circuits();
        if circuits.is_empty() {
            warn!("daemon restarted, but no daemon-routed circuits remain");
            self.release_waiters(false);
            return Ok(());
        }
        for circuit in circuits {
            let ip = self.probe.external_ip(&circuit.connection()).await?;
            self.on_observed_ip_change(&circuit, &ip)?;
        }
        Ok(())
    }

    /// Flush the rate store to its cache file now.
    pub fn snapshot_rate_cache(&self) -> Result<()> {
        self.rate
            .lock()
            .expect("poisoned lock")
            .save(&self.config.cache_path)?;
        Ok(())
    }

    /// Exit-IP discovery, shared with the pollers.
    pub(crate) fn probe(&self) -> &Arc<dyn IpProbe> {
        &self.probe
    }

    /// True while an IP change or daemon restart is in flight.
    pub fn gates_busy(&self) -> bool {
        let gate = self.gate.lock().expect("poisoned lock");
        gate.changing || gate.restarting
    }

    /// Enqueue on the waiter list when a change is in flight.
    fn join_if_changing(&self) -> Option<oneshot::Receiver<bool>> {
        let mut gate = self.gate.lock().expect("poisoned lock");
        if gate.changing {
            let (tx, rx) = oneshot::channel();
            gate.waiters.push(tx);
            Some(rx)
        } else {
            None
        }
    }

    /// Take the lead on a change, or enqueue when someone already has it.
    /// Returns `None` when we lead (with the `changing` gate now set).
    fn begin_change(&self) -> Option<oneshot::Receiver<bool>> {
        let mut gate = self.gate.lock().expect("poisoned lock");
        if gate.changing {
            let (tx, rx) = oneshot::channel();
            gate.waiters.push(tx);
            Some(rx)
        } else {
            gate.changing = true;
            None
        }
    }

    /// Clear both gates and signal every waiter, in enqueue order, exactly
    /// once.
    fn release_waiters(&self, changed: bool) {
        let waiters = {
            let mut gate = self.gate.lock().expect("poisoned lock");
            gate.changing = false;
            gate.restarting = false;
            std::mem::take(&mut gate.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(changed);
        }
    }

    /// Pick a cycling replacement circuit, running the all-unhealthy hook
    /// when the pool is out of healthy circuits.
    fn select_replacement(&self, exclude: Option<&Arc<Circuit>>) -> Result<Option<Arc<Circuit>>> {
        let picked = self
            .pool
            .lock()
            .expect("poisoned lock")
            .select_random(exclude, true);
        match picked {
            Err(Error::AllCircuitsUnhealthy) => {
                self.run_all_unhealthy_hook();
                Err(Error::AllCircuitsUnhealthy)
            }
            other => other,
        }
    }

    /// Run the installed all-unhealthy hook, or log the default complaint.
    fn run_all_unhealthy_hook(&self) {
        match &*self.all_unhealthy_hook.lock().expect("poisoned lock") {
            Some(hook) => hook(),
            None => error!("every circuit in the cycling pool is unhealthy"),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::{CircuitConfigBuilder, MgrConfigBuilder};
    use crate::request::ProxyConnection;
    use async_trait::async_trait;
    use egress_daemon::{DaemonSignal, SignalOutcome};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe whose answer is scripted per proxy URL.
    #[derive(Default)]
    struct MockProbe {
        ips: Mutex<HashMap<String, String>>,
    }

    impl MockProbe {
        fn set(&self, proxy_url: &str, ip: &str) {
            self.ips
                .lock()
                .unwrap()
                .insert(proxy_url.to_owned(), ip.to_owned());
        }
    }

    #[async_trait]
    impl IpProbe for MockProbe {
        async fn external_ip(&self, conn: &ProxyConnection) -> Result<String> {
            self.ips
                .lock()
                .unwrap()
                .get(&conn.proxy_url())
                .cloned()
                .ok_or(Error::Probe {
                    detail: "unscripted route".to_owned(),
                })
        }
    }

    /// Scripted [`ProcessHost`] wired to a [`MockProbe`]: rotating the
    /// "daemon" flips the probe's answer for the daemon route, and
    /// respawning it installs the configured post-restart IP.
    #[derive(Clone)]
    struct MockHost {
        inner: Arc<HostInner>,
    }

    struct HostInner {
        probe: Arc<MockProbe>,
        pids: Mutex<Vec<u32>>,
        daemon_url: Mutex<Option<String>>,
        rotations: Mutex<VecDeque<String>>,
        restart_ip: Mutex<Option<String>>,
        rotate_delay: Mutex<Duration>,
        rotate_count: AtomicU32,
        kills: AtomicU32,
        starts: AtomicU32,
    }

    impl MockHost {
        fn new(probe: Arc<MockProbe>) -> Self {
            MockHost {
                inner: Arc::new(HostInner {
                    probe,
                    pids: Mutex::new(vec![100]),
                    daemon_url: Mutex::new(None),
                    rotations: Mutex::new(VecDeque::new()),
                    restart_ip: Mutex::new(None),
                    rotate_delay: Mutex::new(Duration::ZERO),
                    rotate_count: AtomicU32::new(0),
                    kills: AtomicU32::new(0),
                    starts: AtomicU32::new(0),
                }),
            }
        }

        fn script_daemon(&self, url: &str, rotations: &[&str], restart_ip: Option<&str>) {
            *self.inner.daemon_url.lock().unwrap() = Some(url.to_owned());
            *self.inner.rotations.lock().unwrap() =
                rotations.iter().map(|s| s.to_string()).collect();
            *self.inner.restart_ip.lock().unwrap() = restart_ip.map(|s| s.to_owned());
        }

        fn set_rotate_delay(&self, d: Duration) {
            *self.inner.rotate_delay.lock().unwrap() = d;
        }

        fn rotate_count(&self) -> u32 {
            self.inner.rotate_count.load(Ordering::SeqCst)
        }

        fn kills(&self) -> u32 {
            self.inner.kills.load(Ordering::SeqCst)
        }

        fn starts(&self) -> u32 {
            self.inner.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessHost for MockHost {
        async fn list(&self, _comm: &str) -> std::result::Result<Vec<u32>, egress_daemon::Error> {
            Ok(self.inner.pids.lock().unwrap().clone())
        }

        async fn start_detached(
            &self,
            _cmd: &str,
            _args: &[&str],
        ) -> std::result::Result<(), egress_daemon::Error> {
            self.inner.starts.fetch_add(1, Ordering::SeqCst);
            self.inner.pids.lock().unwrap().push(4242);
            let url = self.inner.daemon_url.lock().unwrap().clone();
            let ip = self.inner.restart_ip.lock().unwrap().clone();
            if let (Some(url), Some(ip)) = (url, ip) {
                self.inner.probe.set(&url, &ip);
            }
            Ok(())
        }

        async fn signal_and_wait(
            &self,
            pid: u32,
            signal: DaemonSignal,
            _wait: Duration,
        ) -> std::result::Result<SignalOutcome, egress_daemon::Error> {
            match signal {
                DaemonSignal::Terminate => {
                    self.inner.kills.fetch_add(1, Ordering::SeqCst);
                    self.inner.pids.lock().unwrap().retain(|p| *p != pid);
                    Ok(SignalOutcome::Exited)
                }
                DaemonSignal::Reconfigure => {
                    self.inner.rotate_count.fetch_add(1, Ordering::SeqCst);
                    let delay = *self.inner.rotate_delay.lock().unwrap();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let url = self.inner.daemon_url.lock().unwrap().clone();
                    let next = self.inner.rotations.lock().unwrap().pop_front();
                    if let (Some(url), Some(ip)) = (url, next) {
                        self.inner.probe.set(&url, &ip);
                    }
                    Ok(SignalOutcome::StillRunning)
                }
                _ => unreachable!("unknown DaemonSignal variant"),
            }
        }
    }

    fn mk(dir: &tempfile::TempDir) -> (Arc<EgressMgr<MockHost>>, Arc<MockProbe>, MockHost) {
        let probe = Arc::new(MockProbe::default());
        let host = MockHost::new(Arc::clone(&probe));
        let supervisor = DaemonSupervisor::new(host.clone())
            .with_startup_grace(Duration::ZERO)
            .with_signal_wait(Duration::ZERO);
        let config = MgrConfigBuilder::default()
            .cache_path(dir.path().join("cache.json"))
            .build()
            .unwrap();
        let mgr = EgressMgr::new(
            supervisor,
            Arc::clone(&probe) as Arc<dyn IpProbe>,
            config,
        );
        (mgr, probe, host)
    }

    /// Circuit config with a poll interval long enough that pollers stay
    /// out of the way during a test.
    fn quiet(port: u16) -> CircuitConfigBuilder {
        let mut b = CircuitConfigBuilder::default();
        b.port(port)
            .poll_interval(Some(Duration::from_secs(3600)));
        b
    }

    const URL_A: &str = "socks5h://0.0.0.0:9050";
    const URL_B: &str = "socks5h://0.0.0.0:9051";

    #[tokio::test]
    async fn fresh_ip_counts_until_exhausted_then_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        probe.set(URL_B, "10.0.0.2");
        mgr.register_action("api", 2, Some(Duration::from_secs(60)));
        let _a = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();
        let b = mgr.add_circuit(quiet(9051).build().unwrap()).await.unwrap();

        let client = mgr.create_client(ClientSpec::Index(0)).unwrap();
        assert!(!client.probe_or_change("api").await.unwrap());
        client.report_action("api").unwrap();
        client.report_action("api").unwrap();
        assert_eq!(mgr.rate_count("10.0.0.1", "api"), 2);

        // Limit reached: the third probe drives a change (a rebind, for a
        // cycling circuit).
        assert!(client.probe_or_change("api").await.unwrap());
        assert!(Arc::ptr_eq(&client.circuit(), &b));
        assert_eq!(client.current_ip().as_deref(), Some("10.0.0.2"));
        assert!(!mgr.gates_busy());
    }

    #[tokio::test]
    async fn observed_change_double_counts_the_ambiguous_window() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        mgr.register_action("api", 10, None);
        let c = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();

        // Pretend the last poll happened a second ago; everything reported
        // after it is ambiguous.
        c.stamp_poll(now_ms() - 1000);
        for _ in 0..3 {
            mgr.report_action("api", &c).unwrap();
        }

        mgr.on_observed_ip_change(&c, "10.0.0.9").unwrap();
        assert_eq!(mgr.rate_count("10.0.0.1", "api"), 3);
        assert_eq!(mgr.rate_count("10.0.0.9", "api"), 3);
        assert_eq!(c.exit_ip().as_deref(), Some("10.0.0.9"));
        assert!(!mgr.gates_busy());
        // The cache is written during unrequested-change processing.
        assert!(dir.path().join("cache.json").exists());
    }

    #[tokio::test]
    async fn concurrent_force_changes_are_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        host.script_daemon(URL_A, &["10.0.0.2"], None);
        host.set_rotate_delay(Duration::from_millis(50));
        let c = mgr
            .add_circuit(quiet(9050).is_local_daemon(true).build().unwrap())
            .await
            .unwrap();

        let cl1 = mgr.create_client(ClientSpec::Index(0)).unwrap();
        let cl2 = mgr.create_client(ClientSpec::Index(0)).unwrap();
        let cl3 = mgr.create_client(ClientSpec::Index(0)).unwrap();

        let t1 = tokio::spawn({
            let cl = Arc::clone(&cl1);
            async move { cl.force_ip_change().await.unwrap() }
        });
        tokio::task::yield_now().await;
        // Caller 1 is now mid-rotation and holds the gate.
        assert!(mgr.gates_busy());
        let t2 = tokio::spawn({
            let cl = Arc::clone(&cl2);
            async move { cl.force_ip_change().await.unwrap() }
        });
        let t3 = tokio::spawn({
            let cl = Arc::clone(&cl3);
            async move { cl.force_ip_change().await.unwrap() }
        });

        assert!(t1.await.unwrap());
        assert!(t2.await.unwrap());
        assert!(t3.await.unwrap());
        // One rotation served all three callers.
        assert_eq!(host.rotate_count(), 1);
        assert!(!mgr.gates_busy());
        assert_eq!(c.exit_ip().as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn force_restart_respawns_daemon_and_reabsorbs_ips() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        host.script_daemon(URL_A, &[], Some("10.0.0.5"));
        let c = mgr
            .add_circuit(quiet(9050).is_local_daemon(true).build().unwrap())
            .await
            .unwrap();

        mgr.force_restart().await.unwrap();
        assert_eq!(host.kills(), 1);
        assert_eq!(host.starts(), 1);
        assert_eq!(c.exit_ip().as_deref(), Some("10.0.0.5"));
        assert!(!mgr.gates_busy());
    }

    #[tokio::test]
    async fn blacklisted_exit_is_exhausted_on_sight() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "163.172.67.180");
        probe.set(URL_B, "10.0.0.2");
        mgr.register_action("api", 1000, None);
        let _a = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();
        let _b = mgr.add_circuit(quiet(9051).build().unwrap()).await.unwrap();

        let client = mgr.create_client(ClientSpec::Index(0)).unwrap();
        // No series at all, but the IP is refused on sight.
        assert!(client.probe_or_change("api").await.unwrap());
        assert_eq!(client.current_ip().as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn remove_circuit_rebinds_clients_but_not_pollers() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        probe.set(URL_B, "10.0.0.2");
        let x = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();
        let y = mgr.add_circuit(quiet(9051).build().unwrap()).await.unwrap();

        let clients: Vec<_> = (0..3)
            .map(|_| mgr.create_client(ClientSpec::Index(0)).unwrap())
            .collect();
        for cl in &clients {
            assert!(Arc::ptr_eq(&cl.circuit(), &x));
        }

        mgr.remove_circuit(&x).await.unwrap();
        assert!(!x.is_valid());
        for cl in &clients {
            assert!(Arc::ptr_eq(&cl.circuit(), &y));
        }
    }

    #[tokio::test]
    async fn removing_last_daemon_circuit_kills_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        let c = mgr
            .add_circuit(quiet(9050).is_local_daemon(true).build().unwrap())
            .await
            .unwrap();
        mgr.remove_circuit(&c).await.unwrap();
        assert_eq!(host.kills(), 1);
    }

    #[tokio::test]
    async fn client_spec_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        let _a = mgr
            .add_circuit(quiet(9050).name(Some("main".to_owned())).build().unwrap())
            .await
            .unwrap();

        assert!(mgr.create_client(ClientSpec::Any).is_ok());
        assert!(mgr.create_client(ClientSpec::Index(0)).is_ok());
        assert!(mgr.create_client(ClientSpec::from("main")).is_ok());
        assert!(matches!(
            mgr.create_client(ClientSpec::Index(7)),
            Err(Error::NoCircuitFound)
        ));
        assert!(matches!(
            mgr.create_client(ClientSpec::from("nope")),
            Err(Error::NoCircuitFound)
        ));
    }

    #[tokio::test]
    async fn rigid_clients_cannot_be_rate_limited_but_may_refuse_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        mgr.register_action("api", 5, None);
        let _r = mgr
            .add_circuit(
                quiet(9050)
                    .in_cycling_pool(false)
                    .name(Some("rigid".to_owned()))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        let client = mgr.create_client(ClientSpec::from("rigid")).unwrap();

        assert!(matches!(
            client.probe_or_change("api").await,
            Err(Error::RigidCircuitMisuse)
        ));
        assert!(matches!(
            client.report_action("api"),
            Err(Error::RigidCircuitMisuse)
        ));
        // Rotation on a rigid circuit is a logged no-op, not an error.
        assert!(!client.force_ip_change().await.unwrap());
    }

    #[tokio::test]
    async fn report_action_with_unset_ip_still_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _probe, _host) = mk(&dir);
        mgr.register_action("api", 5, None);
        let c = Arc::new(Circuit::new(quiet(9050).build().unwrap()));
        mgr.report_action("api", &c).unwrap();
        assert_eq!(mgr.rate_count("", "api"), 1);
    }

    #[tokio::test]
    async fn duplicate_circuit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        let _a = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();
        assert!(matches!(
            mgr.add_circuit(quiet(9050).build().unwrap()).await,
            Err(Error::DuplicateCircuit(_))
        ));
    }

    #[tokio::test]
    async fn rate_cache_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, probe, _host) = mk(&dir);
        probe.set(URL_A, "10.0.0.1");
        mgr.register_action("api", 5, None);
        let c = mgr.add_circuit(quiet(9050).build().unwrap()).await.unwrap();
        mgr.report_action("api", &c).unwrap();
        mgr.snapshot_rate_cache().unwrap();

        // A second manager over the same cache path sees the old usage.
        let (mgr2, _probe2, _host2) = mk(&dir);
        assert_eq!(mgr2.rate_count("10.0.0.1", "api"), 1);
    }
}
