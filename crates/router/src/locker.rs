//! Named async mutexes, created on first use and dropped with their last holder.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;

type Slots = FxHashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Default, Clone)]
pub struct KeyLocker {
    slots: Arc<Mutex<Slots>>,
}

pub struct KeyGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<Slots>>,
}

impl KeyLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: impl Into<String>) -> KeyGuard {
        let name = name.into();
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(name.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard { name, guard: Some(guard), slots: self.slots.clone() }
    }

    /// Names currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // only the map still points at the mutex: nobody holds or awaits it
        if slots.get(&self.name).map(|s| Arc::strong_count(s) == 1).unwrap_or(false) {
            slots.remove(&self.name);
        }
    }
}
