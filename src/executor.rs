//! Worker-thread management: named threads with optional CPU core pinning.

use std::thread::{self, JoinHandle};

use core_affinity::CoreId;
use tracing::{debug, warn};

/// Builder for processor worker threads.
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    name: Option<String>,
    affinity: Option<CoreId>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pin the spawned thread to a CPU core. The pin is best-effort; failure
    /// to apply it is logged, not fatal.
    pub fn pin_at_core(mut self, core_id: usize) -> Self {
        self.affinity = Some(CoreId { id: core_id });
        self
    }

    pub fn spawn<F>(self, f: F) -> std::io::Result<ManagedThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.name.unwrap_or_else(|| "ringflow-worker".to_string());
        let affinity = self.affinity;
        let spawn_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Some(core) = affinity {
                if core_affinity::set_for_current(core) {
                    debug!(thread = %spawn_name, core = core.id, "pinned worker to core");
                } else {
                    warn!(thread = %spawn_name, core = core.id, "could not pin worker to core");
                }
            }
            f();
        })?;

        Ok(ManagedThread {
            handle: Some(handle),
            name,
        })
    }
}

/// Handle to a spawned worker. Joined on drop.
#[derive(Debug)]
pub struct ManagedThread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl ManagedThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// True when the calling thread is this worker. Shutdown paths use this
    /// to avoid a worker joining itself.
    pub fn is_current(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// CPU cores available for pinning.
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|core| core.id)
        .collect()
}
