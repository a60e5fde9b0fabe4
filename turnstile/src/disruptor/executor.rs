//! Threads that run event processors.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::error::ProcessorError;
use super::processor::EventProcessor;
use crate::trace::{debug, error};

/// Unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs units of work somewhere other than the calling thread.
pub trait Executor {
    /// # Errors
    ///
    /// Fails if the executor could not start the task.
    fn execute(&self, task: Task) -> io::Result<()>;
}

/// Spawns one named OS thread per task and keeps the join handles.
pub struct ThreadExecutor {
    name_prefix: String,
    spawned: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadExecutor {
    #[must_use]
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Runs `processor` on its own thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread could not be spawned.
    pub fn spawn_processor<P>(&self, processor: Arc<P>) -> io::Result<()>
    where
        P: EventProcessor + 'static,
    {
        self.execute(Box::new(move || {
            match processor.run() {
                Ok(()) => {}
                Err(ProcessorError::AlreadyRunning) => {
                    error!("processor was already running on another thread");
                }
                Err(ProcessorError::Released) => {
                    error!("processor was released from its ring buffer");
                }
            }
        }))
    }

    /// Waits for every spawned thread and returns how many panicked.
    pub fn join_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());
        handles
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count()
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("turnstile")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) -> io::Result<()> {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{index}", self.name_prefix);
        debug!(thread = %name, "spawning executor thread");
        let handle = thread::Builder::new().name(name).spawn(task)?;
        self.handles.lock().push(handle);
        Ok(())
    }
}
