use std::{cell::RefCell, collections::HashMap, pin::pin, time::Duration};

use futures::future::Either;
use futures_channel::oneshot;

use crate::QueryKey;

/// Eviction timers, one per key.
///
/// Each timer is a spawned task racing a sleep against a oneshot channel.
/// Dropping the sender disarms the timer.
#[derive(Default)]
pub(crate) struct GarbageCollector {
    handles: RefCell<HashMap<QueryKey, oneshot::Sender<()>>>,
}

impl GarbageCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer for `key`.
    pub(crate) fn enable_gc(
        &self,
        key: QueryKey,
        gc_time: Duration,
        on_expire: impl FnOnce() + 'static,
    ) {
        let (sender, receiver) = oneshot::channel::<()>();
        // Replacing the previous sender disarms its timer.
        self.handles
            .try_borrow_mut()
            .expect("enable_gc borrow_mut")
            .insert(key, sender);

        crate::spawn_local(async move {
            let expiry = pin!(crate::sleep(gc_time));
            if let Either::Left(_) = futures::future::select(expiry, receiver).await {
                on_expire();
            }
        });
    }

    /// Disarms the timer for `key`. Returns true if one was armed.
    pub(crate) fn disable_gc(&self, key: &QueryKey) -> bool {
        self.handles
            .try_borrow_mut()
            .expect("disable_gc borrow_mut")
            .remove(key)
            .is_some()
    }

    pub(crate) fn is_enabled(&self, key: &QueryKey) -> bool {
        self.handles
            .try_borrow()
            .expect("is_enabled borrow")
            .contains_key(key)
    }

    /// Disarms every timer.
    pub(crate) fn clear(&self) {
        self.handles
            .try_borrow_mut()
            .expect("clear borrow_mut")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::{cell::Cell, rc::Rc};
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn fires_after_gc_time() {
        LocalSet::new()
            .run_until(async {
                let gc = GarbageCollector::new();
                let fired = Rc::new(Cell::new(false));
                let key = query_key!["gc"];

                gc.enable_gc(key.clone(), Duration::from_secs(10), {
                    let fired = fired.clone();
                    move || fired.set(true)
                });
                assert!(gc.is_enabled(&key));

                tokio::time::sleep(Duration::from_secs(9)).await;
                assert!(!fired.get());
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert!(fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_timer_never_fires() {
        LocalSet::new()
            .run_until(async {
                let gc = GarbageCollector::new();
                let fired = Rc::new(Cell::new(0));
                let key = query_key!["gc"];

                gc.enable_gc(key.clone(), Duration::from_secs(10), {
                    let fired = fired.clone();
                    move || fired.set(fired.get() + 1)
                });
                assert!(gc.disable_gc(&key));
                assert!(!gc.disable_gc(&key));

                tokio::time::sleep(Duration::from_secs(20)).await;
                assert_eq!(fired.get(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn re_arming_replaces_timer() {
        LocalSet::new()
            .run_until(async {
                let gc = GarbageCollector::new();
                let fired = Rc::new(Cell::new(0));
                let key = query_key!["gc"];

                for _ in 0..3 {
                    gc.enable_gc(key.clone(), Duration::from_secs(10), {
                        let fired = fired.clone();
                        move || fired.set(fired.get() + 1)
                    });
                }

                tokio::time::sleep(Duration::from_secs(20)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }
}
