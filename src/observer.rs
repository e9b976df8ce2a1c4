use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::types::{Source, SourceId};

/// A UI surface interested in registry changes.
///
/// Implementations must tolerate a repeated `add` or `update` for the same id.
/// `add` and `del` run while the controller holds its phase lock, so
/// callbacks must not call back into the controller.
pub trait ViewObserver: Send + Sync {
    fn add(&self, source: &Source);
    fn del(&self, id: SourceId);
    fn update(&self, source: &Source);
}

/// Append-only set of weakly held observers. A dropped view simply stops
/// receiving notifications and is pruned on the next fan-out.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Weak<dyn ViewObserver>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: &Arc<dyn ViewObserver>) {
        self.observers.write().push(Arc::downgrade(observer));
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, source: &Source) {
        self.each(|view| view.add(source));
    }

    pub fn del(&self, id: SourceId) {
        self.each(|view| view.del(id));
    }

    pub fn update(&self, source: &Source) {
        self.each(|view| view.update(source));
    }

    fn each<F>(&self, notify: F)
    where
        F: Fn(&dyn ViewObserver),
    {
        // Upgrade under the lock, call outside it so a view may subscribe
        // another view from inside a callback.
        let live: Vec<Arc<dyn ViewObserver>> = {
            let mut observers = self.observers.write();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for view in live {
            notify(view.as_ref());
        }
    }
}
