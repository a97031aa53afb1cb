//! Remote account-service abstractions consumed by workers.

use crate::source::Account;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt;

/// One step of the fixed per-account sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    Connect,
    CheckIn,
    QueryRunningState,
    Stop,
    Reconnect,
    QueryPoints,
    FetchProof,
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemoteStep::Connect => "connect",
            RemoteStep::CheckIn => "check-in",
            RemoteStep::QueryRunningState => "query running state",
            RemoteStep::Stop => "stop",
            RemoteStep::Reconnect => "reconnect",
            RemoteStep::QueryPoints => "query points",
            RemoteStep::FetchProof => "fetch proof",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsSnapshot {
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub referral_code: Option<String>,
    #[serde(default)]
    pub referral_count: u64,
}

/// Client bound to one `(credential, proxy)` pair for the duration of one task.
///
/// Every operation is independently fallible. `close` is called on every exit
/// path of a task, successful or not.
pub trait AccountService: Send {
    fn check_in(&mut self) -> BoxFuture<'_, Result<()>>;

    fn node_running(&mut self) -> BoxFuture<'_, Result<bool>>;

    fn stop_node(&mut self) -> BoxFuture<'_, Result<()>>;

    fn connect_node(&mut self) -> BoxFuture<'_, Result<()>>;

    fn node_points(&mut self) -> BoxFuture<'_, Result<PointsSnapshot>>;

    /// Requests a proof for accounts that have none stored yet.
    fn fetch_proof(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async { Ok(None) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Creates a fresh [`AccountService`] per task.
pub trait AccountServiceFactory: Send + Sync + 'static {
    type Service: AccountService + 'static;

    fn connect(&self, account: &Account, proxy: Option<&str>) -> Result<Self::Service>;
}
