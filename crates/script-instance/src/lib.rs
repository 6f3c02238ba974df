//! Script Instance Lifecycle
//!
//! This crate orchestrates a single embedded script-runtime instance from
//! acquisition to release. The scripting engine itself sits behind the
//! [`ScriptContext`] trait; pooling sits behind [`InstanceBroker`].
//!
//! # Architecture
//!
//! - An [`InstanceLifecycle`] requests an instance from a broker; the broker
//!   answers asynchronously through a one-shot continuation
//! - Once delivered, requested features are exposed in a fixed order before
//!   the entry script runs
//! - The script runs either on the host thread (ticked by the host) or on a
//!   dedicated worker thread (ticking itself until asked to stop)
//! - Teardown is cooperative: the host clears a run flag and waits, bounded,
//!   for the worker before the instance goes back to the broker

pub mod broker;
pub mod context;
mod error;
pub mod events;
mod execution;
pub mod features;
mod instance;
mod lifecycle;
pub mod options;
mod run_state;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{InstanceBroker, PoolConfig, PoolStatus, PooledBroker, ReadyCallback, RequestResult};
pub use context::{ContextFactory, HostObject, ScriptContext};
pub use error::{ContextError, InstanceError, InstanceResult};
pub use events::{EventPublisher, FailureStage, InstanceEvent};
pub use execution::ExecutionModel;
pub use features::{AsyncBridge, ASYNC_BOOTSTRAP, ExposureTargets, Feature, FeatureExposer, FeatureSet};
pub use instance::{Instance, ThreadOwner};
pub use lifecycle::{HostContext, HostKind, InitOutcome, InstanceLifecycle, LifecycleState};
pub use options::{InstanceOptions, ThreadingPolicy, WorkerHint};
pub use run_state::RunState;
