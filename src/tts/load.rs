//! At-most-once loading for the single-threaded synthesis unit.
//!
//! A [`LoadCell`] is either unloaded, loading (a shared handle every caller can
//! await), or loaded. Callers arriving while a load is in flight join it instead of
//! starting another one; a failed load returns the cell to unloaded so the next
//! caller retries.

use std::cell::RefCell;
use std::future::Future;

use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::error::TtsError;

type PendingLoad<T> = Shared<LocalBoxFuture<'static, Result<T, TtsError>>>;

/// Explicit load state.
pub enum LoadState<T: Clone> {
    Unloaded,
    Loading(PendingLoad<T>),
    Loaded(T),
}

/// Holds a [`LoadState`] and drives its transitions.
pub struct LoadCell<T: Clone> {
    state: RefCell<LoadState<T>>,
}

impl<T: Clone + 'static> LoadCell<T> {
    pub fn new() -> Self {
        Self { state: RefCell::new(LoadState::Unloaded) }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.borrow(), LoadState::Loaded(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.borrow(), LoadState::Loading(_))
    }

    /// Return the loaded value, joining an in-flight load or starting one with `start`.
    ///
    /// `start` is only invoked when the cell is unloaded.
    pub async fn get_or_load<F, Fut>(&self, start: F) -> Result<T, TtsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TtsError>> + 'static,
    {
        let pending = {
            let mut state = self.state.borrow_mut();
            let joined = match &*state {
                LoadState::Loaded(value) => return Ok(value.clone()),
                LoadState::Loading(pending) => Some(pending.clone()),
                LoadState::Unloaded => None,
            };
            match joined {
                Some(pending) => pending,
                None => {
                    let pending = start().boxed_local().shared();
                    *state = LoadState::Loading(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        // Whoever observes the result first settles the state; later joiners find it settled.
        let mut state = self.state.borrow_mut();
        if let LoadState::Loading(current) = &*state
            && current.ptr_eq(&pending)
        {
            *state = match &result {
                Ok(value) => LoadState::Loaded(value.clone()),
                Err(_) => LoadState::Unloaded,
            };
        }

        result
    }
}

impl<T: Clone + 'static> Default for LoadCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
