//! Thread-safe live-component registry with a per-type recycling pool.
//!
//! Two locks, deliberately small: one mutex over the id → component map and
//! one over the pool. Neither is ever held while user code (mount/unmount
//! hooks, event handlers) runs — removal snapshots the affected components
//! under the map lock and invokes their hooks after releasing it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::component::SparkComponent;

/// Default per-type pool capacity.
const POOL_CAPACITY: usize = 50;

/// Shared ownership of a registered component.
pub type SharedComponent = Arc<Mutex<SparkComponent>>;

/// Map of live components keyed by id.
pub struct ComponentRegistry {
    components: Mutex<HashMap<String, SharedComponent>>,
    pool: Mutex<HashMap<&'static str, Vec<SharedComponent>>>,
    pool_capacity: usize,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            pool: Mutex::new(HashMap::new()),
            pool_capacity: POOL_CAPACITY,
        }
    }

    /// Registers a component under its id and returns the shared handle.
    pub fn register(&self, component: SparkComponent) -> SharedComponent {
        let id = component.id().to_string();
        let shared = Arc::new(Mutex::new(component));
        self.components.lock().insert(id, shared.clone());
        shared
    }

    pub fn get(&self, id: &str) -> Option<SharedComponent> {
        self.components.lock().get(id).cloned()
    }

    /// Removes a component from the map without running lifecycle hooks.
    pub fn remove(&self, id: &str) -> Option<SharedComponent> {
        self.components.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }

    /// Takes a recycled component of the given type out of the pool.
    pub fn checkout(&self, type_name: &str) -> Option<SharedComponent> {
        self.pool.lock().get_mut(type_name)?.pop()
    }

    /// Number of pooled components for a type. Test seam.
    pub fn pooled(&self, type_name: &str) -> usize {
        self.pool.lock().get(type_name).map(Vec::len).unwrap_or(0)
    }

    /// Drops every disconnected component that is either mounted (its socket
    /// died) or older than `gc_interval` (it never connected). Components
    /// created inside the current sweep window therefore survive exactly one
    /// sweep. Dropped components are unmounted outside the map lock and
    /// recycled into the per-type pool while capacity allows.
    pub fn cleanup_disconnected(&self, gc_interval: Duration) -> usize {
        let doomed: Vec<(String, SharedComponent)> = {
            let mut components = self.components.lock();
            let ids: Vec<String> = components
                .iter()
                .filter(|(_, shared)| {
                    let component = shared.lock();
                    !component.is_connected()
                        && (component.is_mounted() || component.age() > gc_interval)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| components.remove(&id).map(|c| (id, c)))
                .collect()
        };

        let removed = doomed.len();
        for (_, shared) in doomed {
            let type_name = {
                let mut component = shared.lock();
                component.unmount();
                component.type_name()
            };

            let mut pool = self.pool.lock();
            let slot = pool.entry(type_name).or_default();
            if slot.len() < self.pool_capacity {
                slot.push(shared);
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "swept disconnected components");
        }
        removed
    }

    /// Unmounts and drops everything. Invoked on socket-server shutdown.
    ///
    /// The map is snapshotted and cleared under the lock; unmount hooks run
    /// after it is released.
    pub fn cleanup_all(&self) {
        let snapshot: Vec<SharedComponent> = {
            let mut components = self.components.lock();
            let all = components.values().cloned().collect();
            components.clear();
            all
        };
        for shared in snapshot {
            shared.lock().unmount();
        }
    }
}
