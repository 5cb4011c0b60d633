//! Inbound client requests and their replies

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::{AppId, OrderRequest, ProviderName, ProviderRole, Result, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    Logon,
    Logout,
    Subscribe { symbol: Symbol },
    Unsubscribe { symbol: Symbol },
    SendOrder { order: OrderRequest },
}

/// One message from a client application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub app: AppId,
    pub provider: ProviderName,
    pub role: ProviderRole,
    pub kind: RequestKind,
}

impl ClientRequest {
    pub fn new(app: impl Into<AppId>, provider: impl Into<ProviderName>, role: ProviderRole, kind: RequestKind) -> Self {
        Self {
            app: app.into(),
            provider: provider.into(),
            role,
            kind,
        }
    }

    pub fn logon(app: impl Into<AppId>, provider: impl Into<ProviderName>, role: ProviderRole) -> Self {
        Self::new(app, provider, role, RequestKind::Logon)
    }

    pub fn logout(app: impl Into<AppId>, provider: impl Into<ProviderName>, role: ProviderRole) -> Self {
        Self::new(app, provider, role, RequestKind::Logout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    LoggedOn,
    LogonPending,
    AlreadyLoggedOn,
    LoggedOut,
    Disconnected,
    NotLoggedOn,
    Subscribed,
    Unsubscribed,
    OrderSent,
}

/// A request travelling through the inbound channel, with an optional
/// reply slot for callers that wait on the outcome
#[derive(Debug)]
pub struct Inbound {
    pub request: ClientRequest,
    pub reply: Option<oneshot::Sender<Result<Reply>>>,
}

impl Inbound {
    pub fn new(request: ClientRequest) -> Self {
        Self { request, reply: None }
    }

    pub fn with_reply(request: ClientRequest) -> (Self, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(tx),
            },
            rx,
        )
    }
}
