//! Cooperative cancellation of in-flight statements.
//!
//! A [`CancellationSignal`] may be fired from any thread. While a connection is
//! executing on behalf of a signal, the signal's listener is the connection's
//! [`NativeInterrupt`], which flips an atomic flag polled by the engine's
//! progress handler. The engine then abandons the statement with
//! `SQLITE_INTERRUPT`, surfaced as [`Error::OperationCanceled`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};
use crate::global;

/// Notified once when the signal it is registered on is cancelled.
pub trait OnCancelListener: Send + Sync {
    fn on_cancel(&self);
}

impl<F> OnCancelListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_cancel(&self) {
        self()
    }
}

#[derive(Default)]
struct SignalState {
    canceled: bool,
    cancel_in_progress: bool,
    listener: Option<Arc<dyn OnCancelListener>>,
}

#[derive(Default)]
struct SignalInner {
    state: Mutex<SignalState>,
    cancel_done: Condvar,
}

/// Shared cancellation flag with a single listener. Clones observe the same state.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().canceled
    }

    /// Fails with [`Error::OperationCanceled`] once the signal has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::OperationCanceled)
        } else {
            Ok(())
        }
    }

    /// Fires the signal. The listener runs on this thread, outside the lock.
    /// Later calls do nothing.
    pub fn cancel(&self) {
        let listener = {
            let mut state = self.inner.state.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.cancel_in_progress = true;
            state.listener.clone()
        };

        if let Some(listener) = listener {
            listener.on_cancel();
        }

        self.inner.state.lock().cancel_in_progress = false;
        self.inner.cancel_done.notify_all();
    }

    /// Replaces the listener, waiting for a running `cancel` to finish first.
    /// A listener registered on an already cancelled signal is invoked at once.
    pub fn set_on_cancel_listener(&self, listener: Option<Arc<dyn OnCancelListener>>) {
        let mut state = self.inner.state.lock();
        while state.cancel_in_progress {
            self.inner.cancel_done.wait(&mut state);
        }
        let unchanged = match (&state.listener, &listener) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        state.listener = listener.clone();
        let canceled = state.canceled;
        drop(state);

        if canceled {
            if let Some(listener) = listener {
                listener.on_cancel();
            }
        }
    }
}

/// The engine-side half of cancellation: a flag the progress handler polls.
#[derive(Default)]
pub(crate) struct NativeInterrupt {
    flag: Arc<AtomicBool>,
}

impl NativeInterrupt {
    /// Clears the flag and installs (or removes) the progress handler.
    pub(crate) fn reset(&self, db: &rusqlite::Connection, cancelable: bool) {
        self.flag.store(false, Ordering::SeqCst);
        if cancelable {
            let flag = Arc::clone(&self.flag);
            db.progress_handler(
                global::CANCEL_POLL_INSTRUCTIONS,
                Some(move || flag.load(Ordering::SeqCst)),
            );
        } else {
            db.progress_handler(0, None::<fn() -> bool>);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl OnCancelListener for NativeInterrupt {
    fn on_cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Reentrant bridge between signals and one connection's interrupt flag.
///
/// Only the outermost attach arms the interrupt and only the matching detach
/// disarms it; nested calls made while a statement is stepping just count.
pub(crate) struct CancellationCoordinator {
    interrupt: Arc<NativeInterrupt>,
    attach_count: usize,
}

impl CancellationCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            interrupt: Arc::new(NativeInterrupt::default()),
            attach_count: 0,
        }
    }

    pub(crate) fn attach(
        &mut self,
        db: &rusqlite::Connection,
        signal: &CancellationSignal,
    ) -> Result<()> {
        signal.check()?;

        self.attach_count += 1;
        if self.attach_count == 1 {
            self.interrupt.reset(db, true);
            let listener: Arc<dyn OnCancelListener> = self.interrupt.clone();
            signal.set_on_cancel_listener(Some(listener));
        }
        Ok(())
    }

    pub(crate) fn detach(&mut self, db: &rusqlite::Connection, signal: &CancellationSignal) {
        if self.attach_count == 0 {
            warn!("cancellation detach without a matching attach");
            return;
        }
        self.attach_count -= 1;
        if self.attach_count == 0 {
            signal.set_on_cancel_listener(None);
            self.interrupt.reset(db, false);
        }
    }

    pub(crate) fn attach_count(&self) -> usize {
        self.attach_count
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupt.is_set()
    }
}
