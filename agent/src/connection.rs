use crate::backoff::Backoff;
use crate::colony::{register_with_retry, ColonyTransport, RegisterRequest, RuntimeContext};
use crate::config::ServiceSpec;
use crate::discovery::{ColonyInfo, DiscoveryClient};
use crate::endpoint::{self, StickyEndpoints};
use crate::preflight::EbpfCapabilities;
use crate::wireguard::{Datapath, PeerCfg};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Defensive floor for every background loop; triggers are the primary
/// driver.
const LOOP_TICK: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures before the agent gives up its
/// registration.
const HEARTBEAT_STRIKES: u32 = 3;

const PEER_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Never had colony reachability info.
    WaitingDiscovery,
    /// Have colony info but no active registration.
    Unregistered,
    /// A registration attempt is in flight.
    Registering,
    /// Colony accepted us; no heartbeat has succeeded yet.
    Registered,
    /// Last heartbeat succeeded.
    Healthy,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::WaitingDiscovery => "waiting_discovery",
            ConnectionState::Unregistered => "unregistered",
            ConnectionState::Registering => "registering",
            ConnectionState::Registered => "registered",
            ConnectionState::Healthy => "healthy",
        };
        f.write_str(s)
    }
}

/// Mutable connection fields. Guarded by one lock; critical sections are
/// pure field access, never I/O.
#[derive(Debug)]
struct ConnFields {
    state: ConnectionState,
    consecutive_heartbeat_failures: u32,
    /// WireGuard endpoint presently configured on the peer.
    current_endpoint: Option<String>,
    /// Most recent endpoint for which a heartbeat succeeded.
    last_successful_endpoint: Option<String>,
    /// Most recent URL at which registration completed.
    last_successful_reg_url: Option<String>,
    assigned_ip: Option<String>,
    assigned_subnet: Option<String>,
    last_successful_heartbeat: Option<Instant>,
}

/// Identity and payload inputs the manager carries into every registration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub agent_id: String,
    pub colony_id: String,
    pub public_key: String,
    pub labels: HashMap<String, String>,
    pub services: Vec<ServiceSpec>,
    pub ebpf: EbpfCapabilities,
    pub runtime: Option<RuntimeContext>,
}

/// Agent-side connection state machine plus the three background loops
/// keeping colony membership alive.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    discovery: Option<Arc<DiscoveryClient>>,
    transport: Arc<dyn ColonyTransport>,
    datapath: Arc<dyn Datapath>,

    fields: RwLock<ConnFields>,
    colony_info: Mutex<Option<Arc<ColonyInfo>>>,

    /// Serializes registration attempts end to end, datapath configuration
    /// included.
    registration_gate: tokio::sync::Mutex<()>,

    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    discovery_tx: mpsc::Sender<()>,
    discovery_rx: Mutex<Option<mpsc::Receiver<()>>>,

    /// Shared with the heartbeat loop: a successful heartbeat resets the
    /// reconnect schedule.
    reconnect_backoff: Mutex<Backoff>,

    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        discovery: Option<Arc<DiscoveryClient>>,
        transport: Arc<dyn ColonyTransport>,
        datapath: Arc<dyn Datapath>,
        initial_info: Option<ColonyInfo>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (discovery_tx, discovery_rx) = mpsc::channel(1);

        let state = if initial_info.is_some() {
            ConnectionState::Unregistered
        } else {
            ConnectionState::WaitingDiscovery
        };

        ConnectionManager {
            settings,
            discovery,
            transport,
            datapath,
            fields: RwLock::new(ConnFields {
                state,
                consecutive_heartbeat_failures: 0,
                current_endpoint: None,
                last_successful_endpoint: None,
                last_successful_reg_url: None,
                assigned_ip: None,
                assigned_subnet: None,
                last_successful_heartbeat: None,
            }),
            colony_info: Mutex::new(initial_info.map(Arc::new)),
            registration_gate: tokio::sync::Mutex::new(()),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            discovery_tx,
            discovery_rx: Mutex::new(Some(discovery_rx)),
            reconnect_backoff: Mutex::new(Backoff::reconnect()),
            shutdown,
        }
    }

    // ------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.fields.read().unwrap().state
    }

    pub fn assigned_ip(&self) -> Option<String> {
        self.fields.read().unwrap().assigned_ip.clone()
    }

    pub fn assigned_subnet(&self) -> Option<String> {
        self.fields.read().unwrap().assigned_subnet.clone()
    }

    /// The WireGuard endpoint currently configured on the colony peer.
    pub fn colony_endpoint(&self) -> Option<String> {
        self.fields.read().unwrap().current_endpoint.clone()
    }

    pub fn last_successful_heartbeat(&self) -> Option<Instant> {
        self.fields.read().unwrap().last_successful_heartbeat
    }

    pub fn colony_info(&self) -> Option<Arc<ColonyInfo>> {
        self.colony_info.lock().unwrap().clone()
    }

    #[cfg(test)]
    fn consecutive_failures(&self) -> u32 {
        self.fields.read().unwrap().consecutive_heartbeat_failures
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Non-blocking nudge to the reconnection loop; a pending trigger
    /// absorbs further ones.
    pub fn trigger_reconnection(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    pub fn trigger_discovery(&self) {
        let _ = self.discovery_tx.try_send(());
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Refresh colony reachability info. Idempotent; a success while in
    /// `waiting_discovery` advances to `unregistered`.
    pub async fn attempt_discovery(&self) -> Result<Arc<ColonyInfo>> {
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| anyhow!("discovery unavailable: no endpoint configured"))?;

        let info = discovery
            .lookup(&self.settings.colony_id)
            .await
            .map_err(|e| anyhow!("discovery unavailable: {}", e))?;

        Ok(self.store_colony_info(info))
    }

    /// Cache fresh colony info and advance out of `waiting_discovery`.
    /// Also the entry point for synthesized info in config-less mode.
    pub(crate) fn store_colony_info(&self, info: ColonyInfo) -> Arc<ColonyInfo> {
        let info = Arc::new(info);
        *self.colony_info.lock().unwrap() = Some(info.clone());

        let advanced = {
            let mut fields = self.fields.write().unwrap();
            if fields.state == ConnectionState::WaitingDiscovery {
                fields.state = ConnectionState::Unregistered;
                true
            } else {
                false
            }
        };

        if advanced {
            info!(component = "connection", state = %self.state(), "colony discovered");
        }

        info
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// One full registration: RPC with multi-URL retry, then datapath
    /// configuration. Attempts are serialized; a datapath failure counts as
    /// a registration failure and leaves the state `unregistered`.
    pub async fn attempt_registration(&self) -> Result<(String, String)> {
        let _gate = self.registration_gate.lock().await;

        let info = self
            .colony_info()
            .ok_or_else(|| anyhow!("no colony info: discovery has not succeeded yet"))?;

        let last_url = {
            let mut fields = self.fields.write().unwrap();
            fields.state = ConnectionState::Registering;
            fields.last_successful_reg_url.clone()
        };

        let urls = endpoint::registration_url_candidates(
            &info,
            last_url.as_deref(),
            endpoint::DEFAULT_CONNECT_PORT,
        );
        let request = RegisterRequest::new(
            &self.settings.agent_id,
            &self.settings.colony_id,
            &self.settings.public_key,
            self.settings.labels.clone(),
            self.settings.services.clone(),
            self.settings.ebpf,
            self.settings.runtime.clone(),
        );

        let outcome = match register_with_retry(self.transport.as_ref(), &urls, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fields.write().unwrap().state = ConnectionState::Unregistered;
                return Err(anyhow!("registration failed: {}", e));
            }
        };

        match self.configure_mesh(&info, &outcome.mesh_ip, &outcome.mesh_subnet) {
            Ok(wg_endpoint) => {
                {
                    let mut fields = self.fields.write().unwrap();
                    fields.state = ConnectionState::Registered;
                    fields.consecutive_heartbeat_failures = 0;
                    fields.last_successful_reg_url = Some(outcome.url.clone());
                    fields.current_endpoint = Some(wg_endpoint.clone());
                    fields.assigned_ip = Some(outcome.mesh_ip.clone());
                    fields.assigned_subnet = Some(outcome.mesh_subnet.clone());
                }
                info!(
                    component = "connection",
                    state = %self.state(),
                    mesh_ip = %outcome.mesh_ip,
                    endpoint = %wg_endpoint,
                    url = %outcome.url,
                    "registered with colony"
                );
                Ok((outcome.mesh_ip, outcome.mesh_subnet))
            }
            Err(e) => {
                self.fields.write().unwrap().state = ConnectionState::Unregistered;
                Err(anyhow!("mesh configuration failed: {}", e))
            }
        }
    }

    /// Assign the permanent address, then install the colony peer. The
    /// order makes initial routes correct from the first packet, so later
    /// IP changes need no route flush.
    fn configure_mesh(&self, info: &ColonyInfo, ip: &str, subnet: &str) -> Result<String> {
        ip.parse::<Ipv4Addr>()
            .map_err(|_| anyhow!("colony assigned invalid mesh ip {:?}", ip))?;
        if info.mesh_ipv4.is_empty() {
            return Err(anyhow!("colony info carries no mesh address"));
        }

        let sticky = {
            let fields = self.fields.read().unwrap();
            StickyEndpoints {
                last_successful_endpoint: fields.last_successful_endpoint.clone(),
                last_successful_reg_url: fields.last_successful_reg_url.clone(),
            }
        };

        let wg_endpoint = endpoint::select_wg_endpoint(info, &sticky)
            .ok_or_else(|| anyhow!("no viable colony wireguard endpoint"))?;

        let mut allowed_ips = vec![format!("{}/32", info.mesh_ipv4)];
        if !info.mesh_ipv6.is_empty() {
            allowed_ips.push(format!("{}/128", info.mesh_ipv6));
        }

        self.datapath.assign_ip(ip, subnet)?;
        self.datapath.add_peer(&PeerCfg {
            public_key: info.public_key.clone(),
            endpoint: wg_endpoint.clone(),
            allowed_ips,
            keepalive_secs: PEER_KEEPALIVE_SECS,
        })?;

        Ok(wg_endpoint)
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// One heartbeat tick. Missing colony info or an inactive registration
    /// is a silent skip, not a failure.
    pub(crate) async fn heartbeat_once(&self) {
        let info = match self.colony_info() {
            Some(info) => info,
            None => return,
        };
        if !matches!(
            self.state(),
            ConnectionState::Registered | ConnectionState::Healthy
        ) {
            return;
        }
        if info.mesh_ipv4.is_empty() {
            return;
        }

        let port = if info.connect_port == 0 {
            endpoint::DEFAULT_CONNECT_PORT
        } else {
            info.connect_port
        };
        let url = format!("http://{}:{}", info.mesh_ipv4, port);

        match self
            .transport
            .heartbeat(&url, &self.settings.agent_id, "healthy")
            .await
        {
            Ok(true) => self.on_heartbeat_success(),
            Ok(false) => self.on_heartbeat_failure("colony replied not ok"),
            Err(e) => self.on_heartbeat_failure(&e.to_string()),
        }
    }

    fn on_heartbeat_success(&self) {
        {
            let mut fields = self.fields.write().unwrap();
            fields.consecutive_heartbeat_failures = 0;
            fields.last_successful_heartbeat = Some(Instant::now());
            fields.state = ConnectionState::Healthy;
            if fields.current_endpoint != fields.last_successful_endpoint {
                fields.last_successful_endpoint = fields.current_endpoint.clone();
            }
        }
        self.reconnect_backoff.lock().unwrap().reset();
    }

    fn on_heartbeat_failure(&self, reason: &str) {
        let (strikes, dropped) = {
            let mut fields = self.fields.write().unwrap();
            fields.consecutive_heartbeat_failures += 1;
            let strikes = fields.consecutive_heartbeat_failures;

            let dropped = strikes >= HEARTBEAT_STRIKES
                && matches!(
                    fields.state,
                    ConnectionState::Registered | ConnectionState::Healthy
                );
            if dropped {
                fields.state = ConnectionState::Unregistered;
            }
            (strikes, dropped)
        };

        warn!(
            component = "heartbeat",
            state = %self.state(),
            attempt = strikes,
            reason = %reason,
            "heartbeat failed"
        );

        if dropped {
            warn!(
                component = "heartbeat",
                state = %self.state(),
                "heartbeat strike limit reached; reconnecting"
            );
            self.trigger_reconnection();
        }
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Discovery loop: only works while in `waiting_discovery`; invokes
    /// `on_success` with fresh colony info.
    pub fn start_discovery_loop<F>(self: &Arc<Self>, on_success: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ColonyInfo>) + Send + Sync + 'static,
    {
        let mgr = Arc::clone(self);
        let mut rx = self
            .discovery_rx
            .lock()
            .unwrap()
            .take()
            .expect("discovery loop started twice");
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::discovery();
            let mut attempt: u32 = 0;
            let mut tick = tokio::time::interval(LOOP_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(_) = rx.recv() => {}
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if mgr.state() != ConnectionState::WaitingDiscovery {
                    continue;
                }

                attempt += 1;
                match mgr.attempt_discovery().await {
                    Ok(info) => {
                        backoff.reset();
                        attempt = 0;
                        on_success(info);
                    }
                    Err(e) => {
                        let wait = backoff.next();
                        debug!(
                            component = "discovery",
                            state = %mgr.state(),
                            attempt,
                            reason = %e,
                            backoff_ms = wait.as_millis() as u64,
                            "discovery attempt failed"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
            debug!(component = "discovery", "loop exited");
        })
    }

    /// Reconnection loop: consumes triggers while `unregistered` and drives
    /// full registrations with backoff.
    pub fn start_reconnection_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        let mut rx = self
            .reconnect_rx
            .lock()
            .unwrap()
            .take()
            .expect("reconnection loop started twice");
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let mut tick = tokio::time::interval(LOOP_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(_) = rx.recv() => {}
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if mgr.state() != ConnectionState::Unregistered {
                    continue;
                }

                attempt += 1;
                match mgr.attempt_registration().await {
                    Ok((ip, _subnet)) => {
                        attempt = 0;
                        info!(component = "reconnect", state = %mgr.state(), mesh_ip = %ip, "reconnected");
                    }
                    Err(e) => {
                        let wait = mgr.reconnect_backoff.lock().unwrap().next();
                        warn!(
                            component = "reconnect",
                            state = %mgr.state(),
                            attempt,
                            reason = %e,
                            backoff_ms = wait.as_millis() as u64,
                            "registration attempt failed"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
            debug!(component = "reconnect", "loop exited");
        })
    }

    /// Heartbeat loop at the caller-supplied cadence.
    pub fn start_heartbeat_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would race the startup registration.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                mgr.heartbeat_once().await;
            }
            debug!(component = "heartbeat", "loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colony::RegisterResponse;
    use crate::discovery::ObservedEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::collections::VecDeque;

    /// Scripted colony transport for driving the state machine offline.
    #[derive(Default)]
    struct FakeColony {
        register_results: Mutex<VecDeque<Result<RegisterResponse>>>,
        heartbeat_results: Mutex<VecDeque<Result<bool>>>,
        register_in_flight: AtomicUsize,
        register_max_in_flight: AtomicUsize,
    }

    impl FakeColony {
        fn push_register_ok(&self, assignment: &str) {
            self.register_results.lock().unwrap().push_back(Ok(RegisterResponse {
                accepted: true,
                reason: String::new(),
                assigned_ip: assignment.to_string(),
                peers: Vec::new(),
            }));
        }

        fn push_heartbeats(&self, results: &[bool]) {
            let mut q = self.heartbeat_results.lock().unwrap();
            for r in results {
                q.push_back(Ok(*r));
            }
        }

        fn push_heartbeat_errors(&self, n: usize) {
            let mut q = self.heartbeat_results.lock().unwrap();
            for _ in 0..n {
                q.push_back(Err(anyhow!("connection reset")));
            }
        }
    }

    #[async_trait]
    impl ColonyTransport for FakeColony {
        async fn register(&self, _url: &str, _req: &RegisterRequest) -> Result<RegisterResponse> {
            let depth = self.register_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.register_max_in_flight.fetch_max(depth, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = self
                .register_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")));

            self.register_in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn heartbeat(&self, _url: &str, _agent_id: &str, _status: &str) -> Result<bool> {
            self.heartbeat_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    #[derive(Default)]
    struct FakeDatapath {
        assigned: Mutex<Vec<(String, String)>>,
        peers: Mutex<Vec<PeerCfg>>,
    }

    impl Datapath for FakeDatapath {
        fn assign_ip(&self, ip: &str, subnet: &str) -> Result<()> {
            self.assigned.lock().unwrap().push((ip.into(), subnet.into()));
            Ok(())
        }

        fn add_peer(&self, peer: &PeerCfg) -> Result<()> {
            self.peers.lock().unwrap().push(peer.clone());
            Ok(())
        }

        fn refresh_routes(&self) -> Result<()> {
            Ok(())
        }
    }

    fn colony_info() -> ColonyInfo {
        ColonyInfo {
            public_key: "COLONYKEY".into(),
            endpoints: vec!["colony.example:9000".into()],
            observed_endpoints: vec![ObservedEndpoint {
                ip: "1.2.3.4".into(),
                port: 5555,
            }],
            mesh_ipv4: "100.64.0.1".into(),
            mesh_ipv6: String::new(),
            connect_port: 9001,
            metadata: HashMap::new(),
        }
    }

    fn manager(
        transport: Arc<FakeColony>,
        datapath: Arc<FakeDatapath>,
        initial: Option<ColonyInfo>,
    ) -> (Arc<ConnectionManager>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);

        let mgr = Arc::new(ConnectionManager::new(
            ConnectionSettings {
                agent_id: "web01-api".into(),
                colony_id: "prod".into(),
                public_key: "AGENTKEY".into(),
                labels: HashMap::new(),
                services: vec![ServiceSpec::named("api")],
                ebpf: EbpfCapabilities::default(),
                runtime: None,
            },
            None,
            transport,
            datapath,
            initial,
            rx,
        ));

        (mgr, tx)
    }

    #[tokio::test]
    async fn registration_configures_mesh_in_order() {
        let transport = Arc::new(FakeColony::default());
        transport.push_register_ok("100.64.0.7|100.64.0.0/10");
        let datapath = Arc::new(FakeDatapath::default());
        let (mgr, _shutdown) = manager(transport, datapath.clone(), Some(colony_info()));

        let (ip, subnet) = mgr.attempt_registration().await.unwrap();
        assert_eq!(ip, "100.64.0.7");
        assert_eq!(subnet, "100.64.0.0/10");
        assert_eq!(mgr.state(), ConnectionState::Registered);
        assert_eq!(mgr.assigned_ip().as_deref(), Some("100.64.0.7"));
        // Observed endpoint wins and the peer carries the keepalive.
        assert_eq!(mgr.colony_endpoint().as_deref(), Some("1.2.3.4:5555"));

        let assigned = datapath.assigned.lock().unwrap();
        let peers = datapath.peers.lock().unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].allowed_ips, vec!["100.64.0.1/32"]);
        assert_eq!(peers[0].keepalive_secs, 25);
    }

    #[tokio::test]
    async fn registration_without_colony_info_fails() {
        let transport = Arc::new(FakeColony::default());
        let (mgr, _shutdown) = manager(transport, Arc::new(FakeDatapath::default()), None);

        assert_eq!(mgr.state(), ConnectionState::WaitingDiscovery);
        let err = mgr.attempt_registration().await.unwrap_err();
        assert!(err.to_string().contains("no colony info"));
    }

    #[tokio::test]
    async fn invalid_mesh_ip_keeps_state_unregistered() {
        let transport = Arc::new(FakeColony::default());
        transport.push_register_ok("not-an-ip|100.64.0.0/10");
        let (mgr, _shutdown) = manager(transport, Arc::new(FakeDatapath::default()), Some(colony_info()));

        assert!(mgr.attempt_registration().await.is_err());
        assert_eq!(mgr.state(), ConnectionState::Unregistered);
        assert!(mgr.assigned_ip().is_none());
    }

    #[tokio::test]
    async fn concurrent_registrations_are_serialized() {
        let transport = Arc::new(FakeColony::default());
        transport.push_register_ok("100.64.0.7|100.64.0.0/10");
        transport.push_register_ok("100.64.0.7|100.64.0.0/10");
        let (mgr, _shutdown) = manager(transport.clone(), Arc::new(FakeDatapath::default()), Some(colony_info()));

        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.attempt_registration().await })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.attempt_registration().await })
        };
        let _ = a.await.unwrap();
        let _ = b.await.unwrap();

        assert_eq!(transport.register_max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn three_strikes_drop_registration_and_trigger_reconnect() {
        let transport = Arc::new(FakeColony::default());
        transport.push_register_ok("100.64.0.7|100.64.0.0/10");
        let (mgr, _shutdown) = manager(transport.clone(), Arc::new(FakeDatapath::default()), Some(colony_info()));
        mgr.attempt_registration().await.unwrap();

        let mut rx = mgr.reconnect_rx.lock().unwrap().take().unwrap();

        // Two failures: still registered, counter climbing.
        transport.push_heartbeat_errors(2);
        mgr.heartbeat_once().await;
        mgr.heartbeat_once().await;
        assert_eq!(mgr.consecutive_failures(), 2);
        assert_eq!(mgr.state(), ConnectionState::Registered);
        assert!(rx.try_recv().is_err());

        // Third strike drops to unregistered with exactly one trigger.
        transport.push_heartbeat_errors(1);
        mgr.heartbeat_once().await;
        assert_eq!(mgr.consecutive_failures(), 3);
        assert_eq!(mgr.state(), ConnectionState::Unregistered);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_success_resets_counter_and_records_endpoint() {
        let transport = Arc::new(FakeColony::default());
        transport.push_register_ok("100.64.0.7|100.64.0.0/10");
        let (mgr, _shutdown) = manager(transport.clone(), Arc::new(FakeDatapath::default()), Some(colony_info()));
        mgr.attempt_registration().await.unwrap();

        transport.push_heartbeat_errors(2);
        transport.push_heartbeats(&[true]);
        mgr.heartbeat_once().await;
        mgr.heartbeat_once().await;
        mgr.heartbeat_once().await;

        assert_eq!(mgr.consecutive_failures(), 0);
        assert_eq!(mgr.state(), ConnectionState::Healthy);
        // The heartbeat proved the configured endpoint works.
        let fields = mgr.fields.read().unwrap();
        assert_eq!(fields.last_successful_endpoint.as_deref(), Some("1.2.3.4:5555"));
    }

    #[tokio::test]
    async fn heartbeat_skips_silently_before_registration() {
        let transport = Arc::new(FakeColony::default());
        let (mgr, _shutdown) = manager(transport, Arc::new(FakeDatapath::default()), Some(colony_info()));

        // Would pop a scripted error if the RPC were attempted; the script
        // is empty, so an attempt would also bump the failure counter.
        mgr.heartbeat_once().await;
        assert_eq!(mgr.consecutive_failures(), 0);
        assert_eq!(mgr.state(), ConnectionState::Unregistered);
    }

    #[tokio::test]
    async fn reconnect_trigger_coalesces() {
        let transport = Arc::new(FakeColony::default());
        let (mgr, _shutdown) = manager(transport, Arc::new(FakeDatapath::default()), None);

        mgr.trigger_reconnection();
        mgr.trigger_reconnection();
        mgr.trigger_reconnection();

        let mut rx = mgr.reconnect_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stored_colony_info_advances_waiting_discovery() {
        let transport = Arc::new(FakeColony::default());
        let (mgr, _shutdown) = manager(transport, Arc::new(FakeDatapath::default()), None);

        assert_eq!(mgr.state(), ConnectionState::WaitingDiscovery);
        mgr.store_colony_info(colony_info());
        assert_eq!(mgr.state(), ConnectionState::Unregistered);

        // Idempotent: refreshing info from a later state does not regress.
        let transport2 = Arc::new(FakeColony::default());
        transport2.push_register_ok("100.64.0.7|100.64.0.0/10");
        let (mgr2, _shutdown2) = manager(transport2, Arc::new(FakeDatapath::default()), Some(colony_info()));
        mgr2.attempt_registration().await.unwrap();
        mgr2.store_colony_info(colony_info());
        assert_eq!(mgr2.state(), ConnectionState::Registered);
    }

    #[tokio::test]
    async fn loops_exit_on_shutdown() {
        let transport = Arc::new(FakeColony::default());
        let (tx, rx) = watch::channel(false);
        let mgr = Arc::new(ConnectionManager::new(
            ConnectionSettings {
                agent_id: "web01".into(),
                colony_id: "prod".into(),
                public_key: "AGENTKEY".into(),
                labels: HashMap::new(),
                services: Vec::new(),
                ebpf: EbpfCapabilities::default(),
                runtime: None,
            },
            None,
            transport,
            Arc::new(FakeDatapath::default()),
            None,
            rx,
        ));

        let h1 = mgr.start_discovery_loop(|_| {});
        let h2 = mgr.start_reconnection_loop();
        let h3 = mgr.start_heartbeat_loop(Duration::from_secs(1));

        tx.send(true).unwrap();

        let all = async { tokio::try_join!(h1, h2, h3) };
        tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("loops did not exit after shutdown")
            .unwrap();
    }
}
