use crate::database::{BackendError, BackendResult};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A connection handle shared by every worker of one backend.
///
/// The first `acquire` builds the handle, later ones only bump the count.
/// `release` drops the count and hands the handle back to the caller exactly
/// once, on the last release, so it can be torn down.
#[derive(Debug)]
pub struct ConnectionPool<T> {
    backend: &'static str,
    state: Mutex<PoolState<T>>,
}

#[derive(Debug)]
struct PoolState<T> {
    handle: Option<Arc<T>>,
    opens: usize,
}

impl<T> ConnectionPool<T> {
    pub fn new(backend: &'static str) -> Self {
        ConnectionPool {
            backend,
            state: Mutex::new(PoolState {
                handle: None,
                opens: 0,
            }),
        }
    }

    pub fn acquire(&self, init: impl FnOnce() -> BackendResult<T>) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.handle.is_none() {
            state.handle = Some(Arc::new(init()?));
            debug!(backend = self.backend, "connection initialized");
        }
        state.opens += 1;
        Ok(())
    }

    /// Returns the handle when this was the last open.
    pub fn release(&self) -> BackendResult<Option<Arc<T>>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.opens == 0 {
            return Err(BackendError::NotOpen {
                backend: self.backend,
            });
        }
        state.opens -= 1;
        if state.opens > 0 {
            return Ok(None);
        }
        debug!(backend = self.backend, "last user closed, tearing down");
        Ok(state.handle.take())
    }

    pub fn get(&self) -> BackendResult<Arc<T>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle
            .clone()
            .ok_or(BackendError::NotOpen {
                backend: self.backend,
            })
    }

    #[cfg(test)]
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).opens
    }
}
