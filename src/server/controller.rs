//! Application controller - composition root of an engine server
//!
//! Owns one [`SessionMultiplexer`] per served role, the outbound notification
//! pipeline and the optional journal pipeline. Components below report
//! outcomes; this is where they get logged.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{
    Communicator, Config, Error, GatewayEventKind, Notification, NotificationKind, ProviderRole,
    Repository, Result,
};
use crate::pipeline::journal::JournalStats;
use crate::pipeline::{Forwarder, JournalRecord, Journaler, MemoryRepository, Pipeline, PipelineStats};
use crate::server::communicator::LoggingCommunicator;
use crate::server::request::{ClientRequest, Inbound, Reply, RequestKind};
use crate::session::{GatewayFactory, LogonOutcome, LogoutOutcome, ProviderRegistry, SessionMultiplexer};

pub struct ControllerBuilder {
    config: Config,
    kinds: Vec<(String, GatewayFactory)>,
    communicator: Option<Arc<dyn Communicator>>,
    repository: Option<Arc<dyn Repository<JournalRecord>>>,
}

impl ControllerBuilder {
    /// Register a gateway kind for every role
    pub fn kind(mut self, kind: impl Into<String>, factory: GatewayFactory) -> Self {
        self.kinds.push((kind.into(), factory));
        self
    }

    pub fn communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Storage for journaled provider data. Defaults to memory.
    pub fn journal(mut self, repository: Arc<dyn Repository<JournalRecord>>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn build(self) -> Result<Arc<ApplicationController>> {
        let config = self.config;
        config.validate()?;

        let communicator = self
            .communicator
            .unwrap_or_else(|| Arc::new(LoggingCommunicator));
        let cores = &config.pipeline.consumer_cores;

        let outbound = Arc::new(
            Pipeline::builder("outbound", config.pipeline.capacity, config.pipeline.slot_size)
                .handler(Forwarder::new(communicator))
                .cores(cores.iter().take(1).copied().collect())
                .build()?,
        );

        let (journal, journal_stats) = if config.app.journal {
            let repository = self
                .repository
                .unwrap_or_else(|| Arc::new(MemoryRepository::<JournalRecord>::new()));
            let journaler = Journaler::<JournalRecord>::new(repository);
            let stats = journaler.stats();
            let pipeline = Pipeline::builder("journal", config.pipeline.capacity, config.pipeline.slot_size)
                .handler(journaler)
                .cores(cores.iter().skip(1).take(1).copied().collect())
                .build()?;
            (Some(Arc::new(pipeline)), Some(stats))
        } else {
            (None, None)
        };

        let mut multiplexers = HashMap::new();
        for &role in &config.app.roles {
            if multiplexers.contains_key(&role) {
                continue;
            }
            let mut registry = ProviderRegistry::from_config(&config, role);
            for (kind, factory) in &self.kinds {
                registry.register_kind(kind.clone(), Arc::clone(factory));
            }
            let mux = Arc::new(SessionMultiplexer::new(registry));

            let out = Arc::clone(&outbound);
            mux.observe_notifications(move |notification| forward(&out, notification));

            if let Some(journal) = &journal {
                let journal = Arc::clone(journal);
                mux.observe_events(move |event| {
                    if let GatewayEventKind::Data { data } = &event.kind {
                        let record = JournalRecord::new(event.provider.clone(), role, data.clone(), event.received_at);
                        if let Err(e) = journal.publish_record(&record) {
                            warn!(provider = %event.provider, error = %e, "journal publish failed");
                        }
                    }
                });
            }

            info!(role = %role, providers = ?mux.registry().providers(), "multiplexer ready");
            multiplexers.insert(role, mux);
        }

        Ok(Arc::new(ApplicationController {
            name: config.app.name.clone(),
            config,
            multiplexers,
            outbound,
            journal,
            journal_stats,
            running: AtomicBool::new(false),
            reapers: Mutex::new(Vec::new()),
        }))
    }
}

fn forward(outbound: &Pipeline, notification: &Notification) {
    match outbound.publish_record(notification) {
        Ok(_) => {}
        Err(Error::Pipeline(reason)) => debug!(app = %notification.app, reason = %reason, "notification dropped"),
        Err(e) => warn!(app = %notification.app, error = %e, "notification dropped"),
    }
}

pub struct ApplicationController {
    name: String,
    config: Config,
    multiplexers: HashMap<ProviderRole, Arc<SessionMultiplexer>>,
    outbound: Arc<Pipeline>,
    journal: Option<Arc<Pipeline>>,
    journal_stats: Option<Arc<JournalStats>>,
    running: AtomicBool,
    reapers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplicationController {
    pub fn builder(config: Config) -> ControllerBuilder {
        ControllerBuilder {
            config,
            kinds: Vec::new(),
            communicator: None,
            repository: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn multiplexer(&self, role: ProviderRole) -> Option<&Arc<SessionMultiplexer>> {
        self.multiplexers.get(&role)
    }

    pub fn outbound_stats(&self) -> PipelineStats {
        self.outbound.stats()
    }

    pub fn journal_stats(&self) -> Option<(PipelineStats, Arc<JournalStats>)> {
        match (&self.journal, &self.journal_stats) {
            (Some(pipeline), Some(stats)) => Some((pipeline.stats(), Arc::clone(stats))),
            _ => None,
        }
    }

    /// Start pipelines, dispatchers and reapers. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_server(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("start_server needs a tokio runtime: {}", e)))?;
        let mut reapers = self.reapers.lock();
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let started = self.start_components();
        if let Err(e) = started {
            error!(server = %self.name, error = %e, "startup failed");
            for mux in self.multiplexers.values() {
                mux.stop_dispatcher();
            }
            self.stop_pipelines();
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        if let Some(timeout) = self.config.sessions.stale_entry_timeout() {
            let period = self.config.sessions.reap_interval();
            for mux in self.multiplexers.values() {
                let mux = Arc::clone(mux);
                reapers.push(runtime.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        for provider in mux.reap_stale(timeout).await {
                            warn!(role = %mux.role(), provider = %provider, "evicted unreachable provider");
                        }
                    }
                }));
            }
        }

        info!(server = %self.name, roles = self.multiplexers.len(), "server started");
        Ok(())
    }

    fn start_components(&self) -> Result<()> {
        self.outbound.start()?;
        if let Some(journal) = &self.journal {
            journal.start()?;
        }
        for mux in self.multiplexers.values() {
            mux.reopen();
            mux.start_dispatcher()?;
        }
        Ok(())
    }

    fn stop_pipelines(&self) {
        // journal first: the outbound side may still carry session-closed notices
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.stop() {
                error!(pipeline = journal.name(), error = %e, "pipeline stop failed");
            }
        }
        if let Err(e) = self.outbound.stop() {
            error!(pipeline = self.outbound.name(), error = %e, "pipeline stop failed");
        }
    }

    /// Log out every application, stop every gateway, then drain the
    /// pipelines. Idempotent.
    pub async fn stop_server(self: &Arc<Self>) -> Result<()> {
        {
            let mut reapers = self.reapers.lock();
            if !self.running.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            for reaper in reapers.drain(..) {
                reaper.abort();
            }
        }

        let shutdowns = self.multiplexers.values().map(|mux| {
            let mux = Arc::clone(mux);
            async move { (mux.role(), mux.shutdown().await) }
        });
        for (role, results) in futures::future::join_all(shutdowns).await {
            for (provider, result) in results {
                if let Err(e) = result {
                    warn!(role = %role, provider = %provider, error = %e, "gateway stop failed");
                }
            }
        }

        let controller = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            for mux in controller.multiplexers.values() {
                mux.stop_dispatcher();
            }
            controller.stop_pipelines();
        })
        .await
        .map_err(|e| Error::InvalidState(format!("shutdown task failed: {}", e)))?;

        info!(server = %self.name, "server stopped");
        Ok(())
    }

    /// Handle one client request. Errors are returned after being logged.
    pub async fn handle_request(&self, request: ClientRequest) -> Result<Reply> {
        if !self.is_running() {
            return Err(Error::InvalidState(format!("{} is not running", self.name)));
        }
        let mux = self
            .multiplexers
            .get(&request.role)
            .ok_or_else(|| Error::InvalidState(format!("{} does not serve {}", self.name, request.role)))?;
        let ClientRequest { app, provider, role, kind } = &request;

        match kind {
            RequestKind::Logon => match mux.on_logon(provider, app).await {
                Ok(LogonOutcome::Connected) => {
                    info!(role = %role, provider = %provider, app = %app, "logon accepted");
                    Ok(Reply::LoggedOn)
                }
                Ok(LogonOutcome::Pending) => {
                    info!(role = %role, provider = %provider, app = %app, "logon pending connect");
                    Ok(Reply::LogonPending)
                }
                Ok(LogonOutcome::AlreadyLoggedOn) => {
                    info!(role = %role, provider = %provider, app = %app, "duplicate logon ignored");
                    Ok(Reply::AlreadyLoggedOn)
                }
                Err(e) => {
                    warn!(role = %role, provider = %provider, app = %app, error = %e, retryable = e.is_retryable(), "logon failed");
                    let notice = Notification::new(
                        app.clone(),
                        provider.clone(),
                        *role,
                        NotificationKind::LogonFailed { reason: e.to_string() },
                    );
                    // a full ring blocks the publisher; keep that off the runtime workers
                    let outbound = Arc::clone(&self.outbound);
                    if let Err(join) = tokio::task::spawn_blocking(move || forward(&outbound, &notice)).await {
                        warn!(app = %app, error = %join, "logon-failed notice lost");
                    }
                    Err(e)
                }
            },
            RequestKind::Logout => match mux.on_logout(provider, app).await? {
                LogoutOutcome::LoggedOut { remaining } => {
                    info!(role = %role, provider = %provider, app = %app, remaining, "logout");
                    Ok(Reply::LoggedOut)
                }
                LogoutOutcome::Disconnected { stop_error } => {
                    match stop_error {
                        Some(reason) => {
                            warn!(role = %role, provider = %provider, error = %reason, "gateway stop failed")
                        }
                        None => info!(role = %role, provider = %provider, app = %app, "last logout, provider disconnected"),
                    }
                    Ok(Reply::Disconnected)
                }
                LogoutOutcome::NotLoggedOn => {
                    info!(role = %role, provider = %provider, app = %app, "logout for unknown session ignored");
                    Ok(Reply::NotLoggedOn)
                }
            },
            RequestKind::Subscribe { symbol } => mux
                .subscribe(provider, app, symbol)
                .await
                .map(|_| Reply::Subscribed)
                .inspect_err(|e| warn!(provider = %provider, app = %app, symbol = %symbol, error = %e, "subscribe failed")),
            RequestKind::Unsubscribe { symbol } => mux
                .unsubscribe(provider, app, symbol)
                .await
                .map(|_| Reply::Unsubscribed)
                .inspect_err(|e| warn!(provider = %provider, app = %app, symbol = %symbol, error = %e, "unsubscribe failed")),
            RequestKind::SendOrder { order } => mux
                .send_order(provider, app, order)
                .await
                .map(|_| Reply::OrderSent)
                .inspect_err(|e| {
                    warn!(provider = %provider, app = %app, order = %order.client_order_id, error = %e, "order rejected")
                }),
        }
    }

    /// Consume inbound requests until every sender is dropped. Each request
    /// runs on its own task.
    pub async fn serve(self: &Arc<Self>, requests: flume::Receiver<Inbound>) {
        debug!(server = %self.name, "serving requests");
        while let Ok(Inbound { request, reply }) = requests.recv_async().await {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                let result = controller.handle_request(request).await;
                if let Some(reply) = reply {
                    // caller stopped waiting
                    let _ = reply.send(result);
                }
            });
        }
        debug!(server = %self.name, "request channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProviderDescriptor, ProviderName, Side, Symbol};
    use crate::core::OrderRequest;
    use crate::gateways::{SIMULATED_KIND, SimulatedGateway};
    use crate::server::communicator::ChannelCommunicator;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.pipeline.capacity = 64;
        config.providers = vec![
            ProviderDescriptor::new("Blackwood", SIMULATED_KIND, ProviderRole::MarketData)
                .with_param("tick_interval_ms", 0),
            ProviderDescriptor::new("Blackwood", SIMULATED_KIND, ProviderRole::OrderExecution)
                .with_param("tick_interval_ms", 0),
        ];
        config
    }

    fn controller(config: Config) -> (Arc<ApplicationController>, flume::Receiver<Notification>) {
        let (comm, rx) = ChannelCommunicator::pair();
        let controller = ApplicationController::builder(config)
            .kind(SIMULATED_KIND, SimulatedGateway::factory())
            .communicator(Arc::new(comm))
            .build()
            .unwrap();
        (controller, rx)
    }

    async fn next_kind(rx: &flume::Receiver<Notification>) -> NotificationKind {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap()
            .kind
    }

    #[tokio::test]
    async fn test_requests_rejected_when_stopped() {
        let (ctl, _rx) = controller(config());
        let err = ctl
            .handle_request(ClientRequest::logon("App-1", "Blackwood", ProviderRole::MarketData))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_roles_are_separate_namespaces() {
        let (ctl, rx) = controller(config());
        ctl.start_server().unwrap();
        ctl.start_server().unwrap();

        let md = ctl
            .handle_request(ClientRequest::logon("App-1", "Blackwood", ProviderRole::MarketData))
            .await
            .unwrap();
        assert_eq!(md, Reply::LogonPending);
        assert_eq!(next_kind(&rx).await, NotificationKind::LogonArrived);

        let oe = ctl
            .handle_request(ClientRequest::logon("App-1", "Blackwood", ProviderRole::OrderExecution))
            .await
            .unwrap();
        assert_eq!(oe, Reply::LogonPending);
        assert_eq!(next_kind(&rx).await, NotificationKind::LogonArrived);

        for role in [ProviderRole::MarketData, ProviderRole::OrderExecution] {
            assert_eq!(ctl.multiplexer(role).unwrap().providers_map().len(), 1);
        }

        ctl.stop_server().await.unwrap();
        ctl.stop_server().await.unwrap();
        for role in [ProviderRole::MarketData, ProviderRole::OrderExecution] {
            assert!(ctl.multiplexer(role).unwrap().providers_map().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_gets_logon_failed() {
        let (ctl, rx) = controller(config());
        ctl.start_server().unwrap();

        let err = ctl
            .handle_request(ClientRequest::logon("App-1", "Nowhere", ProviderRole::MarketData))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderResolution(_)));
        assert!(matches!(next_kind(&rx).await, NotificationKind::LogonFailed { .. }));

        ctl.stop_server().await.unwrap();
    }

    #[tokio::test]
    async fn test_orders_fill_and_are_journaled() {
        let (ctl, rx) = controller(config());
        ctl.start_server().unwrap();
        let role = ProviderRole::OrderExecution;

        ctl.handle_request(ClientRequest::logon("App-1", "Blackwood", role)).await.unwrap();
        assert_eq!(next_kind(&rx).await, NotificationKind::LogonArrived);

        let order = OrderRequest::market(Symbol::new("IBM"), Side::Buy, Decimal::new(100, 0));
        let reply = ctl
            .handle_request(ClientRequest::new(
                "App-1",
                ProviderName::new("Blackwood"),
                role,
                RequestKind::SendOrder { order },
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::OrderSent);
        assert!(matches!(next_kind(&rx).await, NotificationKind::Data { .. }));

        ctl.stop_server().await.unwrap();
        let (pipeline, journal) = ctl.journal_stats().unwrap();
        assert_eq!(pipeline.published, 1);
        assert_eq!(journal.saved(), 1);
    }

    #[tokio::test]
    async fn test_serve_replies_per_request() {
        let (ctl, _rx) = controller(config());
        ctl.start_server().unwrap();

        let (tx, requests) = flume::unbounded();
        let server = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.serve(requests).await })
        };

        let (logon, reply) = Inbound::with_reply(ClientRequest::logon("App-1", "Blackwood", ProviderRole::MarketData));
        tx.send(logon).unwrap();
        assert_eq!(reply.await.unwrap().unwrap(), Reply::LogonPending);

        let (logout, reply) = Inbound::with_reply(ClientRequest::logout("App-2", "Blackwood", ProviderRole::MarketData));
        tx.send(logout).unwrap();
        assert_eq!(reply.await.unwrap().unwrap(), Reply::NotLoggedOn);

        drop(tx);
        server.await.unwrap();
        ctl.stop_server().await.unwrap();
    }
}
