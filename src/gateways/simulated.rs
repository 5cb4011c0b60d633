//! Simulated provider - in-process venue for local runs and tests
//!
//! Params (all optional):
//! - `connect_delay_ms`: 0 connects inside `start`, otherwise logon arrives later
//! - `fail_first_connects`: number of initial connect attempts that fail
//! - `tick_interval_ms`: quote period for subscribed symbols, 0 disables the ticker
//! - `base_price`: decimal string used for quotes and market fills

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{
    Error, EventSink, Execution, Gateway, OrderRequest, OrderType, ProviderData,
    ProviderDescriptor, ProviderName, Result, Symbol, Tick,
};
use crate::session::GatewayFactory;

/// Quote spread around the base price
const HALF_SPREAD: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

#[derive(Debug, Clone)]
pub struct SimulatedParams {
    pub connect_delay: Duration,
    pub fail_first_connects: u64,
    pub tick_interval: Duration,
    pub base_price: Decimal,
}

impl Default for SimulatedParams {
    fn default() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            fail_first_connects: 0,
            tick_interval: Duration::from_millis(250),
            base_price: Decimal::new(100, 0),
        }
    }
}

impl SimulatedParams {
    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Result<Self> {
        let defaults = Self::default();
        let base_price = match descriptor.param_str("base_price") {
            Some(raw) => Decimal::from_str(raw).map_err(|e| {
                Error::Config(format!("{}: invalid base_price '{}': {}", descriptor.name, raw, e))
            })?,
            None => defaults.base_price,
        };
        Ok(Self {
            connect_delay: descriptor
                .param_u64("connect_delay_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_delay),
            fail_first_connects: descriptor
                .param_u64("fail_first_connects")
                .unwrap_or(defaults.fail_first_connects),
            tick_interval: descriptor
                .param_u64("tick_interval_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            base_price,
        })
    }
}

struct Shared {
    sink: EventSink,
    params: SimulatedParams,
    connected: AtomicBool,
    subscriptions: RwLock<HashSet<Symbol>>,
    ticks: AtomicU64,
}

impl Shared {
    fn quote(&self, symbol: &Symbol) -> Tick {
        // small deterministic walk so consecutive ticks differ
        let step = Decimal::new((self.ticks.fetch_add(1, Ordering::Relaxed) % 10) as i64, 2);
        let mid = self.params.base_price + step;
        Tick {
            symbol: symbol.clone(),
            bid: mid - HALF_SPREAD,
            ask: mid + HALF_SPREAD,
            last: mid,
            timestamp: Utc::now(),
        }
    }

    fn emit_quotes(&self) {
        let symbols: Vec<Symbol> = self.subscriptions.read().iter().cloned().collect();
        for symbol in symbols {
            self.sink.data_arrived(ProviderData::Tick(self.quote(&symbol)));
        }
    }
}

/// Gateway that connects to nothing and quotes from a base price
pub struct SimulatedGateway {
    provider: ProviderName,
    shared: Arc<Shared>,
    connect_attempts: AtomicU64,
    connecting: Mutex<Option<JoinHandle<()>>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SimulatedGateway {
    pub fn new(provider: ProviderName, sink: EventSink, params: SimulatedParams) -> Self {
        Self {
            provider,
            shared: Arc::new(Shared {
                sink,
                params,
                connected: AtomicBool::new(false),
                subscriptions: RwLock::new(HashSet::new()),
                ticks: AtomicU64::new(0),
            }),
            connect_attempts: AtomicU64::new(0),
            connecting: Mutex::new(None),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    /// Factory for the `simulated` gateway kind
    pub fn factory() -> GatewayFactory {
        Arc::new(|descriptor: &ProviderDescriptor, sink: EventSink| -> Result<Arc<dyn Gateway>> {
            let params = SimulatedParams::from_descriptor(descriptor)?;
            Ok(Arc::new(SimulatedGateway::new(descriptor.name.clone(), sink, params)))
        })
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.shared.subscriptions.read().iter().cloned().collect()
    }

    fn go_live(shared: &Arc<Shared>, ticker: &Mutex<Option<JoinHandle<()>>>) {
        shared.connected.store(true, Ordering::SeqCst);
        if !shared.params.tick_interval.is_zero() {
            let quotes = Arc::clone(shared);
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(quotes.params.tick_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    quotes.emit_quotes();
                }
            });
            if let Some(previous) = ticker.lock().replace(handle) {
                previous.abort();
            }
        }
        shared.sink.logon_arrived();
    }

    fn require_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Gateway(format!("{} is not connected", self.provider)))
        }
    }
}

#[async_trait]
impl Gateway for SimulatedGateway {
    fn provider(&self) -> &ProviderName {
        &self.provider
    }

    async fn start(&self) -> Result<()> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let fails = attempt <= self.shared.params.fail_first_connects;
        debug!(provider = %self.provider, attempt, "simulated connect");

        if self.shared.params.connect_delay.is_zero() {
            if fails {
                return Err(Error::connection(&self.provider, format!("attempt {} refused", attempt)));
            }
            Self::go_live(&self.shared, &self.ticker);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let ticker = Arc::clone(&self.ticker);
        let delay = self.shared.params.connect_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if fails {
                shared.sink.connect_failed(format!("attempt {} timed out", attempt));
            } else {
                SimulatedGateway::go_live(&shared, &ticker);
            }
        });
        if let Some(previous) = self.connecting.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.connecting.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        self.shared.subscriptions.write().clear();
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            info!(provider = %self.provider, "simulated session closed");
            self.shared.sink.logout_arrived();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbol: &Symbol) -> Result<()> {
        self.require_connected()?;
        self.shared.subscriptions.write().insert(symbol.clone());
        // snapshot so subscribers do not wait a full tick period
        self.shared
            .sink
            .data_arrived(ProviderData::Tick(self.shared.quote(symbol)));
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &Symbol) -> Result<()> {
        self.require_connected()?;
        self.shared.subscriptions.write().remove(symbol);
        Ok(())
    }

    async fn send_order(&self, order: &OrderRequest) -> Result<()> {
        self.require_connected()?;
        if order.quantity <= Decimal::ZERO {
            self.shared.sink.rejected(
                None,
                format!("order {} rejected: quantity must be positive", order.client_order_id),
            );
            return Ok(());
        }

        let price = match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => price,
            (OrderType::Limit, None) => {
                return Err(Error::Gateway(format!(
                    "limit order {} has no price",
                    order.client_order_id
                )));
            }
            (OrderType::Market, _) => self.shared.quote(&order.symbol).last,
        };

        self.shared.sink.data_arrived(ProviderData::Execution(Execution {
            execution_id: Uuid::new_v4().to_string(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            timestamp: Utc::now(),
        }));
        Ok(())
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        if let Some(handle) = self.connecting.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}
