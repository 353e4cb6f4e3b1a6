use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Multi-subscriber event hook. Subscribers are invoked in subscription
/// order; emitting snapshots the subscriber list first, so a callback
/// may cancel any subscription (including its own) without corrupting
/// the emit in progress.
pub(crate) struct EventDispatcher<T> {
    subscribers: Arc<Mutex<Vec<(u64, Callback<T>)>>>,
    next_id: AtomicU64,
}

impl<T: 'static> EventDispatcher<T> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event_subscriber_lock_poisoned")
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            remove: Arc::new(SubscriberRemover {
                subscribers: Arc::downgrade(&self.subscribers),
            }),
        }
    }

    pub(crate) fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .subscribers
            .lock()
            .expect("event_subscriber_lock_poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }
}

trait RemoveSubscriber: Send + Sync {
    fn remove(&self, id: u64);
}

struct SubscriberRemover<T> {
    subscribers: Weak<Mutex<Vec<(u64, Callback<T>)>>>,
}

impl<T> RemoveSubscriber for SubscriberRemover<T> {
    fn remove(&self, id: u64) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .expect("event_subscriber_lock_poisoned")
                .retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// Handle to an event subscription. Dropping the handle (or calling
/// [`Subscription::cancel`]) removes exactly that subscriber.
pub struct Subscription {
    id: u64,
    remove: Arc<dyn RemoveSubscriber>,
}

impl Subscription {
    pub fn cancel(self) {
        // Drop does the removal.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribers_run_in_subscription_order() {
        let dispatcher = EventDispatcher::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        let _a = dispatcher.subscribe(move |v| seen_a.lock().unwrap().push(("a", *v)));
        let seen_b = seen.clone();
        let _b = dispatcher.subscribe(move |v| seen_b.lock().unwrap().push(("b", *v)));

        dispatcher.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let dispatcher = EventDispatcher::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_cb = count.clone();
        let sub = dispatcher.subscribe(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(&1);
        sub.cancel();
        dispatcher.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_from_inside_a_callback_is_safe() {
        let dispatcher = EventDispatcher::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_cb = slot.clone();
        let count_cb = count.clone();
        let sub = dispatcher.subscribe(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
            // cancel ourselves mid-emit.
            slot_cb.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        dispatcher.emit(&1);
        dispatcher.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
