//! Background worker with cooperative stop

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Cooperative stop flag shared between a worker and its owner
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter
    pub fn set(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    /// Lower the flag
    pub fn clear(&self) {
        *self.inner.0.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the flag is raised
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut raised = flag.lock();
        while !*raised {
            cvar.wait(&mut raised);
        }
    }

    /// Block until the flag is raised or `timeout` elapses; returns the flag
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut raised = flag.lock();
        if !*raised {
            cvar.wait_for(&mut raised, timeout);
        }
        *raised
    }
}

/// A named thread running until its [`StopSignal`] is raised
pub struct Worker<T> {
    name: String,
    stop: StopSignal,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `body` on a new named thread
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = StopSignal::new();
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_stop))?;
        debug!("Worker {} spawned", name);

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raise the stop flag without waiting
    pub fn signal_stop(&self) {
        self.stop.set();
    }

    /// Check if the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Raise the stop flag and join the thread. Idempotent.
    ///
    /// Returns the body's result the first time, `None` afterwards or if the
    /// thread panicked.
    pub fn stop_and_join(&mut self) -> Option<T> {
        let handle = self.handle.take()?;
        self.stop.set();

        if handle.thread().id() == thread::current().id() {
            error!("Worker {} cannot join itself", self.name);
            return None;
        }

        match handle.join() {
            Ok(value) => {
                debug!("Worker {} joined", self.name);
                Some(value)
            }
            Err(_) => {
                error!("Worker {} panicked", self.name);
                None
            }
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.set();
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
