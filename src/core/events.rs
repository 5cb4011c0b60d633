//! Gateway events and addressed client notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AppId, ProviderData, ProviderName, ProviderRole};

/// What a gateway reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEventKind {
    LogonArrived,
    LogoutArrived,
    ConnectFailed { reason: String },
    Data { data: ProviderData },
    /// `app` is set when the rejection concerns a single application's request
    Rejected { app: Option<AppId>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub provider: ProviderName,
    /// Connection instance that produced the event
    #[serde(default)]
    pub generation: u64,
    pub kind: GatewayEventKind,
    pub received_at: DateTime<Utc>,
}

/// Handle a gateway uses to report events back to its multiplexer.
///
/// Every event carries the sink's generation, so events from a gateway that
/// was already replaced can be told apart from the current one's.
#[derive(Debug, Clone)]
pub struct EventSink {
    provider: ProviderName,
    generation: u64,
    tx: flume::Sender<GatewayEvent>,
}

impl EventSink {
    pub fn new(provider: ProviderName, tx: flume::Sender<GatewayEvent>) -> Self {
        Self::for_generation(provider, 0, tx)
    }

    pub fn for_generation(provider: ProviderName, generation: u64, tx: flume::Sender<GatewayEvent>) -> Self {
        Self { provider, generation, tx }
    }

    pub fn provider(&self) -> &ProviderName {
        &self.provider
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: GatewayEventKind) {
        let event = GatewayEvent {
            provider: self.provider.clone(),
            generation: self.generation,
            kind,
            received_at: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(provider = %self.provider, "event dropped, multiplexer gone");
        }
    }

    pub fn logon_arrived(&self) {
        self.emit(GatewayEventKind::LogonArrived);
    }

    pub fn logout_arrived(&self) {
        self.emit(GatewayEventKind::LogoutArrived);
    }

    pub fn connect_failed(&self, reason: impl Into<String>) {
        self.emit(GatewayEventKind::ConnectFailed {
            reason: reason.into(),
        });
    }

    pub fn data_arrived(&self, data: ProviderData) {
        self.emit(GatewayEventKind::Data { data });
    }

    pub fn rejected(&self, app: Option<AppId>, reason: impl Into<String>) {
        self.emit(GatewayEventKind::Rejected {
            app,
            reason: reason.into(),
        });
    }
}

/// Notification payloads delivered to client applications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    LogonArrived,
    LogonFailed { reason: String },
    LogoutArrived,
    /// Session ended by the server rather than by the application
    SessionClosed { reason: String },
    Data { data: ProviderData },
    Rejected { reason: String },
}

/// A notification addressed to one application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub app: AppId,
    pub provider: ProviderName,
    pub role: ProviderRole,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(app: AppId, provider: ProviderName, role: ProviderRole, kind: NotificationKind) -> Self {
        Self {
            app,
            provider,
            role,
            kind,
            timestamp: Utc::now(),
        }
    }
}
