//! Dynamic typed configuration store
//!
//! Named variables with change listeners. The runtime reads its fiber stack
//! size default and the TCP connect timeout from here; the latter is watched
//! for live updates by the hook layer.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named configuration variable of type `T`.
///
/// `set` notifies registered listeners with the old and new values before
/// storing. Listeners run on the caller's thread, outside the value lock.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<FxHashMap<u64, Listener<T>>>,
    next_listener_id: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn new(name: &str, default: T, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(FxHashMap::default()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value, notifying listeners if it changed.
    pub fn set(&self, new: T) {
        let old = {
            let value = self.value.read();
            if *value == new {
                return;
            }
            value.clone()
        };

        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old, &new);
        }

        *self.value.write() = new;
    }

    /// Register a change listener; returns a key for `remove_listener`.
    pub fn add_listener(&self, cb: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(cb));
        id
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }
}

static REGISTRY: Lazy<RwLock<FxHashMap<String, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

/// Process-wide configuration registry.
pub struct Config;

impl Config {
    /// Get the variable named `name`, creating it with `default` if absent.
    ///
    /// Returns `None` (and logs an error) if the name exists with a
    /// different type.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Option<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        {
            let registry = REGISTRY.read();
            if let Some(entry) = registry.get(name) {
                return match entry.clone().downcast::<ConfigVar<T>>() {
                    Ok(var) => Some(var),
                    Err(_) => {
                        log::error!(
                            "config lookup: name {} exists with a different type",
                            name
                        );
                        None
                    }
                };
            }
        }

        let mut registry = REGISTRY.write();
        // Re-check: another thread may have created it between locks.
        if let Some(entry) = registry.get(name) {
            return match entry.clone().downcast::<ConfigVar<T>>() {
                Ok(var) => Some(var),
                Err(_) => {
                    log::error!(
                        "config lookup: name {} exists with a different type",
                        name
                    );
                    None
                }
            };
        }

        let var = Arc::new(ConfigVar::new(name, default, description));
        registry.insert(name.to_string(), var.clone());
        Some(var)
    }
}
