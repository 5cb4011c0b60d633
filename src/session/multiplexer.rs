//! Session multiplexer - many client applications, one gateway per provider.
//!
//! Registrations and connection entries live under one mutex whose critical
//! sections never await. Operations on the same provider are linearized by a
//! per-provider async lane, so gateway start/stop runs without the map lock
//! while other providers proceed in parallel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::core::{
    AppId, Error, EventSink, Gateway, GatewayEvent, GatewayEventKind, Notification,
    NotificationKind, OrderRequest, ProviderName, ProviderRole, Result, Symbol,
};
use crate::session::observers::{ObserverRegistry, SubscriptionId};
use crate::session::registry::ProviderRegistry;

/// Result of a logon request that was not rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonOutcome {
    /// Gateway already connected; logon-arrived was sent to the caller
    Connected,
    /// Connect in progress; logon-arrived follows when the gateway reports it
    Pending,
    /// The application was already registered on this provider
    AlreadyLoggedOn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// Other applications still hold the provider
    LoggedOut { remaining: usize },
    /// Last application left; gateway stopped and entry removed
    Disconnected { stop_error: Option<String> },
    /// The application had no session on this provider
    NotLoggedOn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    Connecting,
    Connected,
    Failed { since: Instant, reason: String },
    /// Gateway reported the link dropped
    Disconnected,
}

struct ProviderConnection {
    gateway: Arc<dyn Gateway>,
    /// Matches the generation of the gateway's event sink
    generation: u64,
    status: LinkStatus,
}

#[derive(Default)]
struct SessionState {
    logins: HashMap<ProviderName, Vec<AppId>>,
    connections: HashMap<ProviderName, ProviderConnection>,
    /// Set by `shutdown`; logons are refused until `reopen`
    closed: bool,
}

type Lane = Arc<AsyncMutex<()>>;

/// What the dispatcher thread picks up next
enum Inbox {
    Event(GatewayEvent),
    Notice(Notification),
}

pub struct SessionMultiplexer {
    role: ProviderRole,
    registry: ProviderRegistry,
    state: Mutex<SessionState>,
    lanes: Mutex<HashMap<ProviderName, Lane>>,
    next_generation: AtomicU64,
    events_tx: flume::Sender<GatewayEvent>,
    events_rx: flume::Receiver<GatewayEvent>,
    notices_tx: flume::Sender<Notification>,
    notices_rx: flume::Receiver<Notification>,
    event_observers: ObserverRegistry<GatewayEvent>,
    notification_observers: ObserverRegistry<Notification>,
    dispatching: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMultiplexer {
    pub fn new(registry: ProviderRegistry) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (notices_tx, notices_rx) = flume::unbounded();
        Self {
            role: registry.role(),
            registry,
            state: Mutex::new(SessionState::default()),
            lanes: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events_tx,
            events_rx,
            notices_tx,
            notices_rx,
            event_observers: ObserverRegistry::new(),
            notification_observers: ObserverRegistry::new(),
            dispatching: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Accept logons again after `shutdown`
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // === LOGON / LOGOUT ===

    /// Register `app` on `provider`, connecting the provider on first use.
    ///
    /// On `Err(Error::Connection)` the entry and registration are kept so a
    /// later logon retries the connect.
    pub async fn on_logon(&self, provider: &ProviderName, app: &AppId) -> Result<LogonOutcome> {
        let lane = self.lane(provider);
        let result = {
            let _serial = lane.lock().await;
            self.logon_serialized(provider, app).await
        };
        self.release_lane(provider, lane);
        result
    }

    async fn logon_serialized(&self, provider: &ProviderName, app: &AppId) -> Result<LogonOutcome> {
        enum Next {
            Done(LogonOutcome),
            Notify,
            Connect(Arc<dyn Gateway>, u64),
            Resolve,
        }

        let next = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let SessionState { logins, connections, .. } = &mut *state;
            match connections.get_mut(provider) {
                Some(conn) => {
                    let apps = logins.entry(provider.clone()).or_default();
                    let duplicate = apps.contains(app);
                    if !duplicate {
                        apps.push(app.clone());
                    }
                    match conn.status {
                        LinkStatus::Connected if duplicate => Next::Done(LogonOutcome::AlreadyLoggedOn),
                        LinkStatus::Connected => Next::Notify,
                        LinkStatus::Connecting if duplicate => Next::Done(LogonOutcome::AlreadyLoggedOn),
                        LinkStatus::Connecting => Next::Done(LogonOutcome::Pending),
                        LinkStatus::Failed { .. } | LinkStatus::Disconnected => {
                            conn.status = LinkStatus::Connecting;
                            Next::Connect(Arc::clone(&conn.gateway), conn.generation)
                        }
                    }
                }
                None => Next::Resolve,
            }
        };

        match next {
            Next::Done(outcome) => Ok(outcome),
            Next::Notify => {
                self.notify_deferred(app, provider, NotificationKind::LogonArrived);
                Ok(LogonOutcome::Connected)
            }
            Next::Connect(gateway, generation) => {
                debug!(role = %self.role, provider = %provider, app = %app, "retrying connect");
                self.connect(provider, gateway, generation).await
            }
            Next::Resolve => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let sink = EventSink::for_generation(provider.clone(), generation, self.events_tx.clone());
                let gateway = self.registry.resolve(provider, sink)?.ok_or_else(|| {
                    Error::ProviderResolution(format!("unknown {} provider {}", self.role, provider))
                })?;

                {
                    let mut state = self.state.lock();
                    if state.closed {
                        return Err(self.closed_error());
                    }
                    state.connections.insert(
                        provider.clone(),
                        ProviderConnection {
                            gateway: Arc::clone(&gateway),
                            generation,
                            status: LinkStatus::Connecting,
                        },
                    );
                    state.logins.insert(provider.clone(), vec![app.clone()]);
                }
                debug!(role = %self.role, provider = %provider, app = %app, generation, "provider entry created");
                self.connect(provider, gateway, generation).await
            }
        }
    }

    async fn connect(&self, provider: &ProviderName, gateway: Arc<dyn Gateway>, generation: u64) -> Result<LogonOutcome> {
        let result = gateway.start().await.map_err(|e| e.to_string());

        let owned = {
            let mut state = self.state.lock();
            match state.connections.get_mut(provider) {
                Some(conn) if conn.generation == generation => {
                    if let Err(reason) = &result {
                        conn.status = LinkStatus::Failed {
                            since: Instant::now(),
                            reason: reason.clone(),
                        };
                    }
                    true
                }
                _ => false,
            }
        };

        // entry removed while start was awaited: nobody owns this gateway
        if !owned {
            if let Err(e) = gateway.stop().await {
                debug!(provider = %provider, error = %e, "stop of orphaned gateway failed");
            }
            return Err(Error::InvalidState(format!(
                "{} session closed while connecting",
                provider
            )));
        }

        match result {
            Ok(()) => Ok(LogonOutcome::Pending),
            Err(reason) => Err(Error::connection(provider, reason)),
        }
    }

    fn closed_error(&self) -> Error {
        Error::InvalidState(format!("{} sessions are closed", self.role))
    }

    /// Remove `app` from `provider`; the last logout stops the gateway.
    pub async fn on_logout(&self, provider: &ProviderName, app: &AppId) -> Result<LogoutOutcome> {
        let lane = self.lane(provider);
        let result = {
            let _serial = lane.lock().await;
            self.logout_serialized(provider, app).await
        };
        self.release_lane(provider, lane);
        result
    }

    async fn logout_serialized(&self, provider: &ProviderName, app: &AppId) -> Result<LogoutOutcome> {
        let gateway = {
            let mut state = self.state.lock();
            let Some(apps) = state.logins.get_mut(provider) else {
                return Ok(LogoutOutcome::NotLoggedOn);
            };
            let Some(pos) = apps.iter().position(|a| a == app) else {
                return Ok(LogoutOutcome::NotLoggedOn);
            };
            apps.remove(pos);
            if !apps.is_empty() {
                return Ok(LogoutOutcome::LoggedOut {
                    remaining: apps.len(),
                });
            }
            state.logins.remove(provider);
            state.connections.remove(provider).map(|c| c.gateway)
        };

        let stop_error = match gateway {
            Some(gateway) => gateway.stop().await.err().map(|e| e.to_string()),
            None => None,
        };
        debug!(role = %self.role, provider = %provider, "provider entry removed");
        Ok(LogoutOutcome::Disconnected { stop_error })
    }

    // === COMMANDS ON BEHALF OF LOGGED-ON APPLICATIONS ===

    pub async fn subscribe(&self, provider: &ProviderName, app: &AppId, symbol: &Symbol) -> Result<()> {
        let lane = self.lane(provider);
        let result = {
            let _serial = lane.lock().await;
            match self.gateway_for(provider, app) {
                Ok(gateway) => gateway.subscribe(symbol).await,
                Err(e) => Err(e),
            }
        };
        self.release_lane(provider, lane);
        result
    }

    pub async fn unsubscribe(&self, provider: &ProviderName, app: &AppId, symbol: &Symbol) -> Result<()> {
        let lane = self.lane(provider);
        let result = {
            let _serial = lane.lock().await;
            match self.gateway_for(provider, app) {
                Ok(gateway) => gateway.unsubscribe(symbol).await,
                Err(e) => Err(e),
            }
        };
        self.release_lane(provider, lane);
        result
    }

    pub async fn send_order(&self, provider: &ProviderName, app: &AppId, order: &OrderRequest) -> Result<()> {
        let lane = self.lane(provider);
        let result = {
            let _serial = lane.lock().await;
            match self.gateway_for(provider, app) {
                Ok(gateway) => gateway.send_order(order).await,
                Err(e) => Err(e),
            }
        };
        self.release_lane(provider, lane);
        result
    }

    fn gateway_for(&self, provider: &ProviderName, app: &AppId) -> Result<Arc<dyn Gateway>> {
        let state = self.state.lock();
        let registered = state
            .logins
            .get(provider)
            .is_some_and(|apps| apps.contains(app));
        match state.connections.get(provider) {
            Some(conn) if registered => Ok(Arc::clone(&conn.gateway)),
            _ => Err(Error::NotLoggedOn {
                provider: provider.clone(),
                app: app.clone(),
            }),
        }
    }

    // === GATEWAY EVENT FAN-OUT ===

    /// Observe raw gateway events for providers with a live entry
    pub fn observe_events(&self, callback: impl Fn(&GatewayEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.event_observers.subscribe(callback)
    }

    /// Observe notifications addressed to applications
    pub fn observe_notifications(
        &self,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.notification_observers.subscribe(callback)
    }

    pub fn unobserve_events(&self, id: SubscriptionId) -> bool {
        self.event_observers.unsubscribe(id)
    }

    pub fn unobserve_notifications(&self, id: SubscriptionId) -> bool {
        self.notification_observers.unsubscribe(id)
    }

    /// Apply one gateway event to session state and fan it out.
    pub fn dispatch(&self, event: GatewayEvent) {
        let (recipients, kind) = {
            let mut state = self.state.lock();
            let SessionState { logins, connections, .. } = &mut *state;
            let Some(conn) = connections.get_mut(&event.provider) else {
                debug!(role = %self.role, provider = %event.provider, "event for provider without entry ignored");
                return;
            };
            if conn.generation != event.generation {
                debug!(
                    role = %self.role,
                    provider = %event.provider,
                    generation = event.generation,
                    current = conn.generation,
                    "event from replaced gateway ignored"
                );
                return;
            }
            let apps = logins.get(&event.provider).cloned().unwrap_or_default();

            match &event.kind {
                GatewayEventKind::LogonArrived => {
                    conn.status = LinkStatus::Connected;
                    (apps, NotificationKind::LogonArrived)
                }
                GatewayEventKind::LogoutArrived => {
                    conn.status = LinkStatus::Disconnected;
                    (apps, NotificationKind::LogoutArrived)
                }
                GatewayEventKind::ConnectFailed { reason } => {
                    conn.status = LinkStatus::Failed {
                        since: Instant::now(),
                        reason: reason.clone(),
                    };
                    (apps, NotificationKind::LogonFailed { reason: reason.clone() })
                }
                GatewayEventKind::Data { data } => (apps, NotificationKind::Data { data: data.clone() }),
                GatewayEventKind::Rejected { app: Some(app), reason } => {
                    let target = apps.into_iter().filter(|a| a == app).collect();
                    (target, NotificationKind::Rejected { reason: reason.clone() })
                }
                GatewayEventKind::Rejected { app: None, reason } => {
                    (apps, NotificationKind::Rejected { reason: reason.clone() })
                }
            }
        };

        self.event_observers.publish(&event);
        for app in &recipients {
            self.notify(app, &event.provider, kind.clone());
        }
    }

    /// Dispatch everything already queued, then deliver queued
    /// notifications. Returns the number of gateway events.
    pub fn drain_events(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event);
            count += 1;
        }
        while let Ok(notification) = self.notices_rx.try_recv() {
            self.notification_observers.publish(&notification);
        }
        count
    }

    /// Run the dispatcher on its own thread. Idempotent.
    pub fn start_dispatcher(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.dispatcher.lock();
        if self.dispatching.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mux = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}-dispatcher", self.role))
            .spawn(move || mux.run_dispatcher())
            .map_err(|e| Error::InvalidState(format!("failed to spawn dispatcher: {}", e)))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the dispatcher thread after it drains queued events. Idempotent.
    pub fn stop_dispatcher(&self) {
        let mut slot = self.dispatcher.lock();
        if !self.dispatching.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = slot.take() {
            if handle.join().is_err() {
                warn!(role = %self.role, "dispatcher thread panicked");
            }
        }
        self.drain_events();
    }

    fn run_dispatcher(&self) {
        debug!(role = %self.role, "dispatcher running");
        while self.dispatching.load(Ordering::Acquire) {
            let next = flume::Selector::new()
                .recv(&self.events_rx, |r| r.map(Inbox::Event))
                .recv(&self.notices_rx, |r| r.map(Inbox::Notice))
                .wait_timeout(Duration::from_millis(50));
            match next {
                Ok(Ok(Inbox::Event(event))) => self.dispatch(event),
                Ok(Ok(Inbox::Notice(notification))) => self.notification_observers.publish(&notification),
                Ok(Err(flume::RecvError::Disconnected)) => break,
                Err(_timeout) => {}
            }
        }
        self.drain_events();
    }

    fn notify(&self, app: &AppId, provider: &ProviderName, kind: NotificationKind) {
        let notification = Notification::new(app.clone(), provider.clone(), self.role, kind);
        self.notification_observers.publish(&notification);
    }

    /// Hand a notification to the dispatcher thread. Used from request
    /// tasks, which must not block on a full outbound pipeline.
    fn notify_deferred(&self, app: &AppId, provider: &ProviderName, kind: NotificationKind) {
        let notification = Notification::new(app.clone(), provider.clone(), self.role, kind);
        if let Err(flume::SendError(notification)) = self.notices_tx.send(notification) {
            self.notification_observers.publish(&notification);
        }
    }

    // === EVICTION AND SHUTDOWN ===

    /// Evict entries whose last connect attempt failed at least `timeout` ago.
    pub async fn reap_stale(&self, timeout: Duration) -> Vec<ProviderName> {
        let now = Instant::now();
        let candidates: Vec<ProviderName> = {
            let state = self.state.lock();
            state
                .connections
                .iter()
                .filter(|(_, c)| Self::is_stale(&c.status, now, timeout))
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut evicted = Vec::new();
        for provider in candidates {
            let lane = self.lane(&provider);
            let removed = {
                let _serial = lane.lock().await;
                let taken = {
                    let mut state = self.state.lock();
                    let stale = state
                        .connections
                        .get(&provider)
                        .is_some_and(|c| Self::is_stale(&c.status, Instant::now(), timeout));
                    if stale {
                        let apps = state.logins.remove(&provider).unwrap_or_default();
                        state.connections.remove(&provider).map(|c| (c, apps))
                    } else {
                        None
                    }
                };
                if let Some((conn, _)) = &taken {
                    if let Err(e) = conn.gateway.stop().await {
                        debug!(provider = %provider, error = %e, "stop of stale gateway failed");
                    }
                }
                taken
            };
            self.release_lane(&provider, lane);

            if let Some((conn, apps)) = removed {
                let reason = match conn.status {
                    LinkStatus::Failed { reason, .. } => format!("provider unreachable: {}", reason),
                    _ => "provider unreachable".to_string(),
                };
                for app in &apps {
                    self.notify_deferred(app, &provider, NotificationKind::SessionClosed { reason: reason.clone() });
                }
                evicted.push(provider);
            }
        }
        evicted
    }

    fn is_stale(status: &LinkStatus, now: Instant, timeout: Duration) -> bool {
        matches!(status, LinkStatus::Failed { since, .. } if now.duration_since(*since) >= timeout)
    }

    /// Refuse further logons, then close every session and stop every
    /// gateway concurrently. Each provider is closed under its lane, so a
    /// logon or connect already in flight finishes first.
    pub async fn shutdown(&self) -> Vec<(ProviderName, Result<()>)> {
        self.state.lock().closed = true;

        let mut providers: Vec<ProviderName> = self.lanes.lock().keys().cloned().collect();
        providers.extend(self.state.lock().connections.keys().cloned());
        providers.sort();
        providers.dedup();

        let closes = providers.into_iter().map(|provider| async move {
            let lane = self.lane(&provider);
            let stopped = {
                let _serial = lane.lock().await;
                let taken = {
                    let mut state = self.state.lock();
                    let apps = state.logins.remove(&provider).unwrap_or_default();
                    state.connections.remove(&provider).map(|c| (c.gateway, apps))
                };
                match taken {
                    Some((gateway, apps)) => {
                        for app in &apps {
                            self.notify_deferred(
                                app,
                                &provider,
                                NotificationKind::SessionClosed {
                                    reason: "server shutting down".into(),
                                },
                            );
                        }
                        Some(gateway.stop().await)
                    }
                    None => None,
                }
            };
            self.release_lane(&provider, lane);
            stopped.map(|result| (provider, result))
        });

        let results: Vec<(ProviderName, Result<()>)> = futures::future::join_all(closes)
            .await
            .into_iter()
            .flatten()
            .collect();
        info!(role = %self.role, providers = results.len(), "all provider sessions closed");
        results
    }

    // === READ-ONLY VIEWS ===

    /// Provider name → live gateway
    pub fn providers_map(&self) -> HashMap<ProviderName, Arc<dyn Gateway>> {
        self.state
            .lock()
            .connections
            .iter()
            .map(|(name, conn)| (name.clone(), Arc::clone(&conn.gateway)))
            .collect()
    }

    /// Provider name → registered applications, in logon order
    pub fn providers_login_request_map(&self) -> HashMap<ProviderName, Vec<AppId>> {
        self.state.lock().logins.clone()
    }

    pub fn registered_apps(&self, provider: &ProviderName) -> Vec<AppId> {
        self.state
            .lock()
            .logins
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// True once the provider's gateway reported logon-arrived
    pub fn is_connected(&self, provider: &ProviderName) -> bool {
        self.state
            .lock()
            .connections
            .get(provider)
            .is_some_and(|c| c.status == LinkStatus::Connected)
    }

    // === PER-PROVIDER LANES ===

    fn lane(&self, provider: &ProviderName) -> Lane {
        let mut lanes = self.lanes.lock();
        Arc::clone(lanes.entry(provider.clone()).or_default())
    }

    /// Drop the lane once nobody holds it and the provider has no entry.
    fn release_lane(&self, provider: &ProviderName, lane: Lane) {
        let mut lanes = self.lanes.lock();
        drop(lane);
        let idle = lanes.get(provider).is_some_and(|l| Arc::strong_count(l) == 1);
        if idle && !self.state.lock().connections.contains_key(provider) {
            lanes.remove(provider);
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    #[cfg(test)]
    fn generation_of(&self, provider: &ProviderName) -> Option<u64> {
        self.state.lock().connections.get(provider).map(|c| c.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProviderDescriptor;
    use crate::session::registry::GatewayFactory;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        orders: AtomicUsize,
        live: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    struct Behaviour {
        fail_first: usize,
        /// Emit logon from `start`
        announce: bool,
        start_delay: Duration,
    }

    impl Default for Behaviour {
        fn default() -> Self {
            Self {
                fail_first: 0,
                announce: true,
                start_delay: Duration::ZERO,
            }
        }
    }

    /// Fails the first `fail_first` connects; reports logout when a live
    /// session is stopped.
    struct TestGateway {
        provider: ProviderName,
        sink: EventSink,
        counters: Arc<Counters>,
        behaviour: Behaviour,
        connected: AtomicBool,
    }

    #[async_trait]
    impl Gateway for TestGateway {
        fn provider(&self) -> &ProviderName {
            &self.provider
        }

        async fn start(&self) -> Result<()> {
            let attempt = self.counters.starts.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.behaviour.start_delay.is_zero() {
                tokio::time::sleep(self.behaviour.start_delay).await;
            }
            if attempt <= self.behaviour.fail_first {
                return Err(Error::Gateway("connection refused".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            self.counters.live.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.announce {
                self.sink.logon_arrived();
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            if self.connected.swap(false, Ordering::SeqCst) {
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
                self.sink.logout_arrived();
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send_order(&self, _order: &OrderRequest) -> Result<()> {
            self.counters.orders.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn factory(counters: Arc<Counters>, behaviour: Behaviour) -> GatewayFactory {
        Arc::new(move |d: &ProviderDescriptor, sink: EventSink| -> Result<Arc<dyn Gateway>> {
            Ok(Arc::new(TestGateway {
                provider: d.name.clone(),
                sink,
                counters: counters.clone(),
                behaviour,
                connected: AtomicBool::new(false),
            }))
        })
    }

    fn multiplexer(counters: Arc<Counters>, fail_first: usize) -> SessionMultiplexer {
        multiplexer_with(
            counters,
            Behaviour {
                fail_first,
                ..Behaviour::default()
            },
        )
    }

    fn multiplexer_with(counters: Arc<Counters>, behaviour: Behaviour) -> SessionMultiplexer {
        let registry = ProviderRegistry::new(
            ProviderRole::MarketData,
            vec![
                ProviderDescriptor::new("Blackwood", "test", ProviderRole::MarketData),
                ProviderDescriptor::new("Sterling", "test", ProviderRole::MarketData),
            ],
        )
        .with_kind("test", factory(counters, behaviour));
        SessionMultiplexer::new(registry)
    }

    fn collect_notifications(mux: &SessionMultiplexer) -> Arc<Mutex<Vec<Notification>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mux.observe_notifications(move |n| sink.lock().push(n.clone()));
        seen
    }

    fn blackwood() -> ProviderName {
        ProviderName::new("Blackwood")
    }

    #[tokio::test]
    async fn test_shared_connection_is_reference_counted() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);
        let (app1, app2) = (AppId::new("App-1"), AppId::new("App-2"));

        assert_eq!(mux.on_logon(&blackwood(), &app1).await.unwrap(), LogonOutcome::Pending);
        mux.drain_events();
        assert_eq!(mux.on_logon(&blackwood(), &app2).await.unwrap(), LogonOutcome::Connected);

        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(mux.providers_map().len(), 1);
        assert_eq!(mux.registered_apps(&blackwood()), vec![app1.clone(), app2.clone()]);

        assert_eq!(
            mux.on_logout(&blackwood(), &app1).await.unwrap(),
            LogoutOutcome::LoggedOut { remaining: 1 }
        );
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
        assert_eq!(mux.providers_map().len(), 1);

        assert_eq!(
            mux.on_logout(&blackwood(), &app2).await.unwrap(),
            LogoutOutcome::Disconnected { stop_error: None }
        );
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(mux.providers_map().is_empty());
        assert!(!mux.providers_login_request_map().contains_key(&blackwood()));
        assert_eq!(mux.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_logon_and_unknown_logout_are_noops() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);
        let app = AppId::new("App-1");

        mux.on_logon(&blackwood(), &app).await.unwrap();
        mux.drain_events();
        assert_eq!(
            mux.on_logon(&blackwood(), &app).await.unwrap(),
            LogonOutcome::AlreadyLoggedOn
        );
        assert_eq!(mux.registered_apps(&blackwood()).len(), 1);

        let before = mux.providers_login_request_map();
        assert_eq!(
            mux.on_logout(&blackwood(), &AppId::new("Stranger")).await.unwrap(),
            LogoutOutcome::NotLoggedOn
        );
        assert_eq!(
            mux.on_logout(&ProviderName::new("Sterling"), &app).await.unwrap(),
            LogoutOutcome::NotLoggedOn
        );
        assert_eq!(mux.providers_login_request_map(), before);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected_without_mutation() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);

        let err = mux
            .on_logon(&ProviderName::new("Nowhere"), &AppId::new("App-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderResolution(_)));
        assert!(mux.providers_map().is_empty());
        assert!(mux.providers_login_request_map().is_empty());
        assert_eq!(mux.lane_count(), 0);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logon_arrived_reaches_pending_apps() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters, 0);
        let seen = collect_notifications(&mux);
        let app = AppId::new("App-1");

        mux.on_logon(&blackwood(), &app).await.unwrap();
        assert!(seen.lock().is_empty());
        assert!(!mux.is_connected(&blackwood()));

        assert_eq!(mux.drain_events(), 1);
        assert!(mux.is_connected(&blackwood()));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].app, app);
        assert_eq!(seen[0].kind, NotificationKind::LogonArrived);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_entry_and_retries() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 1);
        let seen = collect_notifications(&mux);
        let (app1, app2) = (AppId::new("App-1"), AppId::new("App-2"));

        let err = mux.on_logon(&blackwood(), &app1).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(mux.providers_map().len(), 1);
        assert_eq!(mux.registered_apps(&blackwood()), vec![app1.clone()]);
        mux.drain_events();
        assert!(seen.lock().is_empty());

        // another app's logon reuses the entry and retries the connect
        assert_eq!(mux.on_logon(&blackwood(), &app2).await.unwrap(), LogonOutcome::Pending);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(mux.providers_map().len(), 1);

        mux.drain_events();
        let recipients: Vec<AppId> = seen.lock().iter().map(|n| n.app.clone()).collect();
        assert_eq!(recipients, vec![app1, app2]);
    }

    #[tokio::test]
    async fn test_providers_are_independent() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);
        let app = AppId::new("App-1");
        let sterling = ProviderName::new("Sterling");

        mux.on_logon(&blackwood(), &app).await.unwrap();
        mux.on_logon(&sterling, &app).await.unwrap();
        assert_eq!(mux.providers_map().len(), 2);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);

        mux.on_logout(&blackwood(), &app).await.unwrap();
        assert_eq!(mux.providers_map().len(), 1);
        assert!(mux.providers_map().contains_key(&sterling));
    }

    #[tokio::test]
    async fn test_data_fans_out_and_rejections_are_addressed() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters, 0);
        let (app1, app2) = (AppId::new("App-1"), AppId::new("App-2"));
        mux.on_logon(&blackwood(), &app1).await.unwrap();
        mux.on_logon(&blackwood(), &app2).await.unwrap();
        mux.drain_events();

        let seen = collect_notifications(&mux);
        let raw = Arc::new(Mutex::new(0usize));
        let raw_count = raw.clone();
        mux.observe_events(move |_| *raw_count.lock() += 1);

        let generation = mux.generation_of(&blackwood()).unwrap();
        let sink = EventSink::for_generation(blackwood(), generation, mux.events_tx.clone());
        sink.data_arrived(crate::core::ProviderData::Tick(crate::core::Tick {
            symbol: Symbol::new("MSFT"),
            bid: rust_decimal::Decimal::ONE,
            ask: rust_decimal::Decimal::TWO,
            last: rust_decimal::Decimal::ONE,
            timestamp: chrono::Utc::now(),
        }));
        sink.rejected(Some(app2.clone()), "bad symbol");
        // events for a provider without an entry are dropped
        EventSink::new(ProviderName::new("Sterling"), mux.events_tx.clone()).logon_arrived();
        assert_eq!(mux.drain_events(), 3);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0].kind, NotificationKind::Data { .. }));
        assert!(matches!(seen[1].kind, NotificationKind::Data { .. }));
        assert_eq!(seen[2].app, app2);
        assert!(matches!(seen[2].kind, NotificationKind::Rejected { .. }));
        assert_eq!(*raw.lock(), 2);
    }

    #[tokio::test]
    async fn test_commands_require_logon() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);
        let app = AppId::new("App-1");
        let order = OrderRequest::market(Symbol::new("MSFT"), crate::core::Side::Buy, rust_decimal::Decimal::ONE);

        let err = mux.send_order(&blackwood(), &app, &order).await.unwrap_err();
        assert!(matches!(err, Error::NotLoggedOn { .. }));

        mux.on_logon(&blackwood(), &app).await.unwrap();
        mux.send_order(&blackwood(), &app, &order).await.unwrap();
        assert_eq!(counters.orders.load(Ordering::SeqCst), 1);

        // default trait impl
        let err = mux.subscribe(&blackwood(), &app, &Symbol::new("MSFT")).await.unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_reaper_evicts_failed_entries() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), usize::MAX);
        let seen = collect_notifications(&mux);
        let app = AppId::new("App-1");

        assert!(mux.on_logon(&blackwood(), &app).await.is_err());
        assert!(mux.reap_stale(Duration::from_secs(60)).await.is_empty());
        assert_eq!(mux.providers_map().len(), 1);

        let evicted = mux.reap_stale(Duration::ZERO).await;
        assert_eq!(evicted, vec![blackwood()]);
        assert!(mux.providers_map().is_empty());
        assert!(mux.providers_login_request_map().is_empty());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        mux.drain_events();
        assert!(matches!(
            seen.lock()[0].kind,
            NotificationKind::SessionClosed { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters.clone(), 0);
        let seen = collect_notifications(&mux);
        mux.on_logon(&blackwood(), &AppId::new("App-1")).await.unwrap();
        mux.on_logon(&ProviderName::new("Sterling"), &AppId::new("App-2")).await.unwrap();

        let results = mux.shutdown().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
        assert!(mux.providers_map().is_empty());
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        // late logout events find no entry
        mux.drain_events();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|n| matches!(n.kind, NotificationKind::SessionClosed { .. })));
        drop(seen);

        let err = mux.on_logon(&blackwood(), &AppId::new("App-3")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        mux.reopen();
        assert_eq!(
            mux.on_logon(&blackwood(), &AppId::new("App-3")).await.unwrap(),
            LogonOutcome::Pending
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_inflight_logons() {
        let counters = Arc::new(Counters::default());
        let mux = Arc::new(multiplexer_with(
            counters.clone(),
            Behaviour {
                start_delay: Duration::from_millis(100),
                ..Behaviour::default()
            },
        ));
        let logon = |app: &'static str| {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.on_logon(&blackwood(), &AppId::new(app)).await })
        };

        let first = logon("App-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        // queued on the lane behind the slow connect
        let second = logon("App-2");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let results = mux.shutdown().await;
        assert_eq!(first.await.unwrap().unwrap(), LogonOutcome::Pending);
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        assert_eq!(results.len(), 1);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(mux.providers_map().is_empty());
        assert!(mux.providers_login_request_map().is_empty());
        assert_eq!(mux.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_late_events_from_replaced_gateway_are_ignored() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer_with(
            counters.clone(),
            Behaviour {
                announce: false,
                ..Behaviour::default()
            },
        );
        let seen = collect_notifications(&mux);
        let (app1, app2, app3) = (AppId::new("App-1"), AppId::new("App-2"), AppId::new("App-3"));

        assert_eq!(mux.on_logon(&blackwood(), &app1).await.unwrap(), LogonOutcome::Pending);
        let first = mux.generation_of(&blackwood()).unwrap();
        EventSink::for_generation(blackwood(), first, mux.events_tx.clone()).logon_arrived();
        mux.drain_events();
        assert!(mux.is_connected(&blackwood()));

        // the stopped gateway's logout is still queued when App-2 recreates the entry
        assert_eq!(
            mux.on_logout(&blackwood(), &app1).await.unwrap(),
            LogoutOutcome::Disconnected { stop_error: None }
        );
        assert_eq!(mux.on_logon(&blackwood(), &app2).await.unwrap(), LogonOutcome::Pending);
        assert_ne!(mux.generation_of(&blackwood()), Some(first));
        assert_eq!(mux.drain_events(), 1);

        assert_eq!(mux.on_logon(&blackwood(), &app3).await.unwrap(), LogonOutcome::Pending);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(mux.registered_apps(&blackwood()), vec![app2, app3]);
        mux.drain_events();
        assert!(seen.lock().iter().all(|n| n.kind != NotificationKind::LogoutArrived));
    }

    #[tokio::test]
    async fn test_connected_logon_notice_is_queued_for_dispatcher() {
        let counters = Arc::new(Counters::default());
        let mux = multiplexer(counters, 0);
        let seen = collect_notifications(&mux);
        let (app1, app2) = (AppId::new("App-1"), AppId::new("App-2"));

        mux.on_logon(&blackwood(), &app1).await.unwrap();
        assert_eq!(mux.drain_events(), 1);
        assert_eq!(seen.lock().len(), 1);

        assert_eq!(mux.on_logon(&blackwood(), &app2).await.unwrap(), LogonOutcome::Connected);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(mux.drain_events(), 0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].app, app2);
        assert_eq!(seen[1].kind, NotificationKind::LogonArrived);
    }

    #[tokio::test]
    async fn test_dispatcher_thread_delivers_events() {
        let counters = Arc::new(Counters::default());
        let mux = Arc::new(multiplexer(counters, 0));
        let seen = collect_notifications(&mux);
        mux.start_dispatcher().unwrap();
        mux.start_dispatcher().unwrap();

        mux.on_logon(&blackwood(), &AppId::new("App-1")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        mux.stop_dispatcher();
        mux.stop_dispatcher();
        assert_eq!(seen.lock().len(), 1);
    }
}
