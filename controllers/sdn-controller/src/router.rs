//! Event Router: watch notifications to queue entries.
//!
//! Each watched kind gets one `EventRouter` holding a static
//! `EventHandlers` table. The router remembers the last object seen per key
//! so it can tell adds from updates, drop updates that changed nothing the
//! controller cares about, and turn keys that vanished during a re-list into
//! deletes.

use crate::queues::Queues;
use kube::{Resource, ResourceExt};
use kube_runtime::watcher::Event;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Dispatch table for one resource kind
pub struct EventHandlers<K> {
    /// Object seen for the first time
    pub add: fn(&Queues, &K),
    /// Object changed (old, new); only called when fingerprints differ
    pub update: fn(&Queues, &K, &K),
    /// Object removed
    pub delete: fn(&Queues, &K),
    /// Hash of the content that matters for reconciliation
    pub fingerprint: fn(&K) -> u64,
}

impl<K> std::fmt::Debug for EventHandlers<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers").finish_non_exhaustive()
    }
}

/// Queue key of an object: `namespace/name`, or `name` when cluster scoped.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Splits a queue key into (namespace, name); namespace is empty when cluster scoped.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// Hash of the object without `status`, `resourceVersion` and `managedFields`.
///
/// Status writes, including the controller's own, never trigger an update.
pub fn content_fingerprint<K: Serialize>(obj: &K) -> u64 {
    let mut value = serde_json::to_value(obj).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.remove("resourceVersion");
            metadata.remove("managedFields");
        }
    }
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Hash of the object without `resourceVersion` and `managedFields`, keeping status.
pub fn full_fingerprint<K: Serialize>(obj: &K) -> u64 {
    let mut value = serde_json::to_value(obj).unwrap_or_default();
    if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata.remove("resourceVersion");
        metadata.remove("managedFields");
    }
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
struct Seen<K> {
    objects: HashMap<String, (u64, Arc<K>)>,
    /// Keys delivered by the re-list in progress, if any
    relist: Option<HashSet<String>>,
}

/// Routes the watch events of one kind
#[derive(Debug)]
pub struct EventRouter<K: 'static> {
    kind: &'static str,
    handlers: &'static EventHandlers<K>,
    queues: Arc<Queues>,
    seen: Mutex<Seen<K>>,
    synced: AtomicBool,
}

impl<K> EventRouter<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Creates a router for `kind` dispatching through `handlers`.
    pub fn new(kind: &'static str, handlers: &'static EventHandlers<K>, queues: Arc<Queues>) -> Self {
        Self {
            kind,
            handlers,
            queues,
            seen: Mutex::new(Seen {
                objects: HashMap::new(),
                relist: None,
            }),
            synced: AtomicBool::new(false),
        }
    }

    fn seen(&self) -> MutexGuard<'_, Seen<K>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the first full list has been delivered.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Number of objects currently known.
    pub fn len(&self) -> usize {
        self.seen().objects.len()
    }

    /// True when no object is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches one watch event.
    pub fn handle(&self, event: Event<K>) {
        match event {
            Event::Apply(obj) => self.apply(obj),
            Event::Delete(obj) => self.delete(obj),
            Event::Init => {
                debug!("Re-listing {}", self.kind);
                self.seen().relist = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let Some(relist) = self.seen().relist.as_mut() {
                    relist.insert(object_key(&obj));
                }
                self.apply(obj);
            }
            Event::InitDone => self.finish_relist(),
        }
    }

    fn apply(&self, obj: K) {
        let key = object_key(&obj);
        let fingerprint = (self.handlers.fingerprint)(&obj);
        let obj = Arc::new(obj);
        let previous = self
            .seen()
            .objects
            .insert(key.clone(), (fingerprint, Arc::clone(&obj)));

        match previous {
            None => {
                trace!("{} {} added", self.kind, key);
                (self.handlers.add)(&self.queues, &obj);
            }
            Some((old_fingerprint, _)) if old_fingerprint == fingerprint => {
                trace!("{} {} unchanged, dropping update", self.kind, key);
            }
            Some((_, old)) => {
                trace!("{} {} updated", self.kind, key);
                (self.handlers.update)(&self.queues, &old, &obj);
            }
        }
    }

    fn delete(&self, obj: K) {
        let key = object_key(&obj);
        self.seen().objects.remove(&key);
        trace!("{} {} deleted", self.kind, key);
        (self.handlers.delete)(&self.queues, &obj);
    }

    fn finish_relist(&self) {
        let vanished: Vec<Arc<K>> = {
            let mut seen = self.seen();
            let Some(listed) = seen.relist.take() else {
                return;
            };
            let gone: Vec<String> = seen
                .objects
                .keys()
                .filter(|key| !listed.contains(*key))
                .cloned()
                .collect();
            gone.iter()
                .filter_map(|key| seen.objects.remove(key).map(|(_, obj)| obj))
                .collect()
        };
        for obj in &vanished {
            debug!("{} {} missing after re-list, treating as deleted", self.kind, object_key(obj.as_ref()));
            (self.handlers.delete)(&self.queues, obj);
        }
        if !self.synced.swap(true, Ordering::AcqRel) {
            debug!("{} cache synced", self.kind);
        }
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;
