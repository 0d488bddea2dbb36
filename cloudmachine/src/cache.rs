use crate::common::CloudMachineResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type Slot<C> = Arc<OnceCell<Arc<C>>>;

/// Registry of named sub-clients owned by one domain client.
///
/// Each logical name maps to at most one handle for the lifetime of the
/// registry. Every name has its own slot: two tasks asking for the same name
/// concurrently observe the same instance, while lookups of other names never
/// wait on a creation in progress.
pub struct ClientCache<C: ?Sized> {
    entries: Mutex<HashMap<String, Slot<C>>>,
}

impl<C: ?Sized> ClientCache<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, name: &str) -> Slot<C> {
        let mut entries = self.entries.lock().await;
        Arc::clone(entries.entry(name.to_string()).or_default())
    }

    /// Returns the cached handle for `name`, building it with `create` on a miss.
    pub async fn get_or_create<F>(&self, name: &str, create: F) -> Arc<C>
    where
        F: FnOnce() -> Arc<C>,
    {
        let slot = self.slot(name).await;
        if let Some(existing) = slot.get() {
            log::debug!("Client cache hit for '{name}'");
            return Arc::clone(existing);
        }
        Arc::clone(slot.get_or_init(|| async move { create() }).await)
    }

    /// Fallible, async variant of [`get_or_create`](Self::get_or_create).
    ///
    /// Only callers asking for `name` wait while it is being created. A failed
    /// creation leaves nothing cached, so the next call retries.
    pub async fn get_or_try_create_with<F, Fut>(
        &self,
        name: &str,
        create: F,
    ) -> CloudMachineResult<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CloudMachineResult<Arc<C>>>,
    {
        let slot = self.slot(name).await;
        if let Some(existing) = slot.get() {
            log::debug!("Client cache hit for '{name}'");
            return Ok(Arc::clone(existing));
        }

        match slot.get_or_try_init(create).await {
            Ok(client) => {
                log::debug!("Cached new client for '{name}'");
                Ok(Arc::clone(client))
            }
            Err(e) => {
                let mut entries = self.entries.lock().await;
                let unused = entries
                    .get(name)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
                if unused {
                    entries.remove(name);
                }
                Err(e)
            }
        }
    }

    pub async fn insert(&self, name: &str, client: Arc<C>) {
        let slot = Arc::new(OnceCell::new_with(Some(client)));
        self.entries.lock().await.insert(name.to_string(), slot);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<C>> {
        self.entries
            .lock()
            .await
            .get(name)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<C>> {
        self.entries
            .lock()
            .await
            .remove(name)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.get(name).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Empties the registry, returning every handle it held.
    pub async fn drain(&self) -> Vec<(String, Arc<C>)> {
        self.entries
            .lock()
            .await
            .drain()
            .filter_map(|(name, slot)| slot.get().cloned().map(|client| (name, client)))
            .collect()
    }
}

impl<C: ?Sized> Default for ClientCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
