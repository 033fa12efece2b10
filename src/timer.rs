use crate::prelude::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type Callback = Arc<dyn Fn(u64) + Send + Sync>;

/// Single-shot restartable countdown.
///
/// Each `start` bumps a generation number which is handed to the callback on
/// expiry. Callbacks usually post an event back into the owning task; the
/// owner compares the generation with [`Timer::is_current`] so an expiry that
/// was already queued when the timer got restarted or stopped is ignored.
pub struct Timer {
    name: &'static str,
    callback: Callback,
    generation: u64,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl Timer {
    pub fn new<F>(name: &'static str, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self {
            name,
            callback: Arc::new(callback),
            generation: 0,
            handle: None,
            closed: false,
        }
    }

    /// (Re)arms the timer. Must be called from within a tokio runtime.
    pub fn start(&mut self, after: Duration) {
        if self.closed {
            return;
        }
        self.abort();
        self.generation += 1;

        let generation = self.generation;
        let callback = self.callback.clone();
        trace!("timer {} armed for {:?} (gen {})", self.name, after, generation);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            callback(generation);
        }));
    }

    pub fn stop(&mut self) {
        self.abort();
        self.generation += 1;
    }

    /// Stops the timer for good; later `start` calls are ignored.
    pub fn close(&mut self) {
        self.stop();
        self.closed = true;
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        !self.closed && generation == self.generation
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("running", &self.is_running())
            .finish()
    }
}
