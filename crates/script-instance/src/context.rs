//! Runtime context contract.
//!
//! A `ScriptContext` is the engine-side half of an instance: it parses and
//! runs script code, holds the exposed-symbol namespace and owns the garbage
//! collector. The lifecycle only ever calls it through this trait, so any
//! engine binding (or a test double) can sit behind an instance.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::error::ContextError;
use crate::options::InstanceOptions;

/// A host object bound into the script environment under a name.
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// Operations the lifecycle consumes from a live runtime context.
///
/// Implementations must tolerate calls from the host thread and from one
/// dedicated worker thread, though never concurrently from both for the
/// same script-visible operation.
pub trait ScriptContext: Send + Sync + 'static {
    /// Whether the underlying engine context is still usable.
    fn is_valid(&self) -> bool;

    /// Bind a host object into the script environment under `name`.
    fn expose(&self, name: &str, object: HostObject) -> Result<(), ContextError>;

    /// Read a script shipped with the runtime (bootstrap wrappers and the like).
    fn read_script_file(&self, path: &str) -> Result<String, ContextError>;

    /// Evaluate script source in the context.
    fn run_script(&self, content: &str) -> Result<(), ContextError>;

    /// Load and evaluate a script file.
    fn run_file(&self, path: &Path) -> Result<(), ContextError>;

    /// Attach a debugging inspector listening on `port`.
    fn create_inspector(&self, port: u16) -> Result<(), ContextError>;

    /// Ask the engine to collect garbage on the calling thread.
    fn request_garbage_collection(&self);

    /// Install the module-resolution hook.
    fn expose_module_system(&self) -> Result<(), ContextError>;
}

/// Creates fresh runtime contexts for a broker.
pub trait ContextFactory: Send + Sync + 'static {
    fn create(&self, options: &InstanceOptions) -> Result<Arc<dyn ScriptContext>, ContextError>;
}

impl<F> ContextFactory for F
where
    F: Fn(&InstanceOptions) -> Result<Arc<dyn ScriptContext>, ContextError> + Send + Sync + 'static,
{
    fn create(&self, options: &InstanceOptions) -> Result<Arc<dyn ScriptContext>, ContextError> {
        self(options)
    }
}
