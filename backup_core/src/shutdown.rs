//! Cooperative shutdown signalling.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;

/// A cloneable stop flag. Workers poll [`ShutdownFlag::is_set`] between
/// windows; the scheduler awaits [`ShutdownFlag::wait`] so a signal can
/// interrupt the sleep until the next tick.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Completes once the flag is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_is_visible_to_clones() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.set();
        assert!(clone.is_set());
    }

    #[tokio::test]
    async fn wait_returns_after_set() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        flag.set();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let flag = ShutdownFlag::new();
        flag.set();
        flag.wait().await;
    }
}
