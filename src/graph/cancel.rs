use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, bounded};

struct Inner {
    flag: AtomicBool,
    /// Dropped on cancel, which disconnects `rx` and wakes every `select!`
    /// waiting on it.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// A cooperative cancellation signal shared between the caller, the
/// scheduler, and every running task.
///
/// Cancelling never interrupts running work. Tasks are expected to poll
/// [`CancelToken::is_cancelled`] and bail out early, and the scheduler stops
/// handing out new work as soon as it observes the signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);

        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// A receiver that becomes disconnected once the token is cancelled.
    /// Meant to be used as a `recv` arm in `crossbeam_channel::select!`.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
