//! Dry-run runtime context.
//!
//! Stands in for an engine binding: scripts are read from the scripts
//! directory and checked for existence, and every call is logged instead of
//! evaluated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use script_instance::{ContextError, ContextFactory, HostObject, InstanceOptions, ScriptContext};

/// A context that records what a real engine would have been asked to do.
pub struct DryRunContext {
    scripts_dir: PathBuf,
    valid: AtomicBool,
    bound: Mutex<Vec<String>>,
    evaluated: AtomicUsize,
    collections: AtomicUsize,
    modules: AtomicBool,
}

impl DryRunContext {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            valid: AtomicBool::new(true),
            bound: Mutex::new(Vec::new()),
            evaluated: AtomicUsize::new(0),
            collections: AtomicUsize::new(0),
            modules: AtomicBool::new(false),
        }
    }

    /// Names bound so far, in binding order
    pub fn bound_names(&self) -> Vec<String> {
        self.bound.lock().clone()
    }

    /// Scripts and files evaluated so far
    pub fn evaluated(&self) -> usize {
        self.evaluated.load(Ordering::SeqCst)
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::SeqCst)
    }

    pub fn has_module_system(&self) -> bool {
        self.modules.load(Ordering::SeqCst)
    }

    /// Mark the context unusable, as an engine would after a fatal error.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.scripts_dir.join(path)
        }
    }

    fn read(&self, path: &Path) -> Result<String, ContextError> {
        let resolved = self.resolve(path);
        std::fs::read_to_string(&resolved)
            .map_err(|_| ContextError::FileNotFound(resolved.display().to_string()))
    }
}

impl ScriptContext for DryRunContext {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn expose(&self, name: &str, _object: HostObject) -> Result<(), ContextError> {
        if !self.is_valid() {
            return Err(ContextError::Invalid);
        }
        debug!(name, "Binding host object");
        self.bound.lock().push(name.to_string());
        Ok(())
    }

    fn read_script_file(&self, path: &str) -> Result<String, ContextError> {
        self.read(Path::new(path))
    }

    fn run_script(&self, content: &str) -> Result<(), ContextError> {
        if !self.is_valid() {
            return Err(ContextError::Invalid);
        }
        debug!(bytes = content.len(), "Evaluating script source");
        self.evaluated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run_file(&self, path: &Path) -> Result<(), ContextError> {
        if !self.is_valid() {
            return Err(ContextError::Invalid);
        }
        let source = self.read(path)?;
        info!(path = %path.display(), bytes = source.len(), "Running entry script");
        self.evaluated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_inspector(&self, port: u16) -> Result<(), ContextError> {
        info!(port, "Inspector requested (dry run, not listening)");
        Ok(())
    }

    fn request_garbage_collection(&self) {
        self.collections.fetch_add(1, Ordering::SeqCst);
    }

    fn expose_module_system(&self) -> Result<(), ContextError> {
        if !self.is_valid() {
            return Err(ContextError::Invalid);
        }
        self.modules.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates [`DryRunContext`]s rooted at one scripts directory.
pub struct DryRunFactory {
    scripts_dir: PathBuf,
    created: Arc<AtomicUsize>,
}

impl DryRunFactory {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared count of contexts created by this factory
    pub fn created(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.created)
    }
}

impl ContextFactory for DryRunFactory {
    fn create(&self, options: &InstanceOptions) -> Result<Arc<dyn ScriptContext>, ContextError> {
        if !self.scripts_dir.is_dir() {
            return Err(ContextError::FileNotFound(self.scripts_dir.display().to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(entry = %options.entry_script.display(), "Creating dry-run context");
        Ok(Arc::new(DryRunContext::new(&self.scripts_dir)))
    }
}
