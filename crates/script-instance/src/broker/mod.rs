//! Instance brokers.
//!
//! A broker owns the pool of runtime instances. Acquisition is asynchronous:
//! `request_instance` answers immediately with `Queued` or `Rejected`, and a
//! queued request later hands its instance to `on_ready` exactly once, on
//! whatever thread the broker chooses.

mod pool;

pub use pool::{PoolConfig, PoolStatus, PooledBroker};

use std::sync::Arc;

use crate::instance::Instance;
use crate::options::InstanceOptions;

/// Continuation invoked once a queued request has an instance.
pub type ReadyCallback = Box<dyn FnOnce(Arc<Instance>) + Send + 'static>;

/// Immediate answer to an acquisition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// `on_ready` will be called later
    Queued,
    /// `on_ready` will never be called
    Rejected,
}

/// Contract between a lifecycle and the component that pools instances.
pub trait InstanceBroker: Send + Sync + 'static {
    /// Request an instance configured for `options`.
    fn request_instance(&self, options: &InstanceOptions, on_ready: ReadyCallback) -> RequestResult;

    /// Hand an instance back. Must be called exactly once per delivered
    /// instance, and only once nothing is executing against it.
    fn release_instance(&self, instance: Arc<Instance>);
}
