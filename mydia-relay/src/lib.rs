#[macro_use]
extern crate tracing;

pub mod api;
pub mod cleanup;
pub mod config;
pub mod extract;
pub mod http;
pub mod listener;
pub mod log;
pub mod namespace;
pub mod pending;
pub mod ratelimit;
pub mod registry;
pub mod service;
pub mod storage;
pub mod task;
pub mod token;
pub mod tunnel;
pub mod version;

mod tls;

use std::sync::Arc;

use crate::config::ConfHandle;
use crate::namespace::NamespaceDeriver;
use crate::pending::PendingRequests;
use crate::ratelimit::RedeemRateLimiter;
use crate::registry::ConnectionRegistry;
use crate::storage::RelayStore;
use crate::task::ShutdownSignal;

/// Shared state behind every HTTP handler and tunnel task.
///
/// Everything in here is cheap to clone: handles over `Arc`ed interiors.
#[derive(Clone)]
pub struct RelayState {
    pub conf_handle: ConfHandle,
    pub store: RelayStore,
    pub connections: ConnectionRegistry,
    pub pendings: PendingRequests,
    pub redeem_limiter: RedeemRateLimiter,
    pub namespace: Arc<NamespaceDeriver>,
    pub shutdown_signal: ShutdownSignal,
}
