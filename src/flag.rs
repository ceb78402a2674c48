use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    state: AtomicBool,
    notify: Notify,
}

/// A one-shot async flag.
///
/// Raised exactly once to signal shutdown; every long-running loop in the
/// coordinator selects on [`ShutdownFlag::wait`] next to its own work.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<Shared>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.state.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.state.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        // The flag must be re-checked after constructing the Notified so a
        // raise() that lands between the check and the registration is not
        // lost.
        loop {
            if self.is_raised() {
                return;
            }

            let notified = self.0.notify.notified();
            if self.is_raised() {
                return;
            }

            notified.await;
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Raises the flag when dropped.
///
/// Each coordinator loop holds one of these so that any loop exiting (cleanly
/// or via an error) takes the rest of the process down with it.
pub struct ShutdownGuard<'a>(&'a ShutdownFlag);

impl<'a> ShutdownGuard<'a> {
    pub fn new(flag: &'a ShutdownFlag) -> Self {
        Self(flag)
    }
}

impl<'a> Drop for ShutdownGuard<'a> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("coordinator loop shutting down without the shutdown flag being raised");
        }

        self.0.raise();
    }
}
