use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::{Source, SourceId, SourceMetadata, WindowId};

struct Entry {
    source: Source,
    registered_at: u64,
    touched: u64,
}

#[derive(Default)]
struct Inner {
    sources: HashMap<SourceId, Entry>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory map of active sources. Every operation runs under one lock, so
/// no reader ever sees a half-applied mutation.
#[derive(Default)]
pub struct SourceRegistry {
    inner: RwLock<Inner>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new source with no media state. If `id` is already present
    /// the existing entry is kept and returned unchanged.
    pub fn register(
        &self,
        id: SourceId,
        window: WindowId,
        url: Option<String>,
        metadata: SourceMetadata,
    ) -> Source {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.sources.get(&id) {
            log::warn!("Source {} registered twice, keeping the existing entry", id);
            return existing.source.clone();
        }

        let now = inner.tick();
        let source = Source {
            id,
            window,
            url,
            metadata,
            media: None,
        };
        inner.sources.insert(
            id,
            Entry {
                source: source.clone(),
                registered_at: now,
                touched: now,
            },
        );
        source
    }

    pub fn get(&self, id: SourceId) -> Option<Source> {
        self.inner.read().sources.get(&id).map(|e| e.source.clone())
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.inner.read().sources.contains_key(&id)
    }

    /// Apply `patch` to the entry in place and return the patched copy.
    /// Absent ids are left alone and yield `None`.
    pub fn update<F>(&self, id: SourceId, patch: F) -> Option<Source>
    where
        F: FnOnce(&mut Source),
    {
        let mut inner = self.inner.write();
        let now = inner.tick();
        let entry = inner.sources.get_mut(&id)?;
        patch(&mut entry.source);
        entry.touched = now;
        Some(entry.source.clone())
    }

    /// Remove an entry. Absent ids are a no-op.
    pub fn unregister(&self, id: SourceId) -> Option<Source> {
        self.inner.write().sources.remove(&id).map(|e| e.source)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All sources, most recently registered first.
    pub fn list(&self) -> Vec<Source> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.sources.values().collect();
        entries.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        entries.into_iter().map(|e| e.source.clone()).collect()
    }

    /// The source worth mirroring: the most recently touched one that is
    /// playing, otherwise the most recently touched one with media state.
    pub fn now_playing(&self) -> Option<Source> {
        let inner = self.inner.read();
        let latest = |playing_only: bool| {
            inner
                .sources
                .values()
                .filter(|e| e.source.media.is_some())
                .filter(|e| !playing_only || e.source.is_playing())
                .max_by_key(|e| e.touched)
                .map(|e| e.source.clone())
        };
        latest(true).or_else(|| latest(false))
    }
}
