//! Instance handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use uuid::Uuid;

use crate::context::ScriptContext;

/// Which execution context currently drives an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadOwner {
    /// Not running anything (pooled, or between phases)
    None = 0,
    /// Running on the host's update thread
    Host = 1,
    /// Running on the lifecycle's dedicated worker thread
    Worker = 2,
}

impl ThreadOwner {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Worker,
            _ => Self::None,
        }
    }
}

/// One live handle to an embedded script-runtime context.
///
/// Brokers hand out `Arc<Instance>`; the acquiring lifecycle is the only
/// owner until it hands the handle back through `release_instance`. The
/// dedicated worker borrows a clone for the duration of its run.
pub struct Instance {
    id: Uuid,
    context: Arc<dyn ScriptContext>,
    owner: AtomicU8,
}

impl Instance {
    pub fn new(context: Arc<dyn ScriptContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            owner: AtomicU8::new(ThreadOwner::None as u8),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The runtime context behind this instance.
    pub fn context(&self) -> &dyn ScriptContext {
        self.context.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.context.is_valid()
    }

    pub fn owner(&self) -> ThreadOwner {
        ThreadOwner::from_u8(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, owner: ThreadOwner) {
        self.owner.store(owner as u8, Ordering::Release);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .field("valid", &self.is_valid())
            .finish()
    }
}
