//! External provider boundary.
//!
//! A [`SyncModelProvider`] is the pipeline's only window onto the backend:
//! listing per-source manifests and fetching individual models by key and
//! hash. Calls are blocking from the caller's point of view and honor
//! cooperative cancellation through a [`CancelToken`]; retry, timeout and
//! scheduling policy all belong to the host.

use crate::error::{Error, Result};
use crate::model::{SyncManifest, SyncModel};
use crate::types::{ContentHash, StreamKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation flag, cheaply cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Bail out with [`Error::Cancelled`] if the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Interface to the remote model backend.
///
/// Implementations must check the token at natural suspension points and
/// return [`Error::Cancelled`] once it trips; a canceled call must leave no
/// caller-visible side effects.
#[cfg_attr(test, mockall::automock)]
pub trait SyncModelProvider: Send + Sync {
    /// Fetch the current manifest of every available source.
    fn list_manifests(&self, cancel: &CancelToken) -> Result<Vec<SyncManifest>>;

    /// Fetch one model at a specific content version.
    fn fetch_model(
        &self,
        key: &StreamKey,
        hash: &ContentHash,
        cancel: &CancelToken,
    ) -> Result<SyncModel>;
}

/// In-memory provider for tests and demos.
///
/// Content is edited through [`put`](MemorySyncProvider::put) /
/// [`remove`](MemorySyncProvider::remove); every hash ever published stays
/// fetchable, so a pipeline may still pull an older version mid-diff.
/// Listing failures can be injected to exercise `FetchError` paths.
#[derive(Default)]
pub struct MemorySyncProvider {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // Source insertion order is the listing order.
    order: Vec<String>,
    manifests: HashMap<String, SyncManifest>,
    models: HashMap<(StreamKey, ContentHash), SyncModel>,
    list_error: Option<String>,
}

impl MemorySyncProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or re-publish under a new hash) a model in a source.
    pub fn put(&self, source: &str, model: SyncModel, hash: &str) {
        let mut inner = self.lock();
        let Inner {
            order,
            manifests,
            models,
            ..
        } = &mut *inner;
        let manifest = manifests.entry(source.to_owned()).or_insert_with(|| {
            order.push(source.to_owned());
            SyncManifest::new(source)
        });
        let kind = model.kind();
        let id = model.id().to_owned();
        manifest.append(kind, id.clone(), hash);
        let key = StreamKey::new(source, kind, id);
        models.insert((key, ContentHash::from(hash)), model);
    }

    /// Drop an entry from a source's manifest. Published versions stay
    /// fetchable.
    pub fn remove(&self, source: &str, kind: crate::types::ModelKind, id: &str) {
        let mut inner = self.lock();
        if let Some(manifest) = inner.manifests.get_mut(source) {
            manifest.remove(kind, id);
        }
    }

    /// Make every subsequent `list_manifests` fail until cleared with `None`.
    pub fn set_list_error(&self, message: Option<&str>) {
        self.lock().list_error = message.map(str::to_owned);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SyncModelProvider for MemorySyncProvider {
    fn list_manifests(&self, cancel: &CancelToken) -> Result<Vec<SyncManifest>> {
        cancel.check()?;
        let inner = self.lock();
        if let Some(message) = &inner.list_error {
            return Err(Error::Fetch(message.clone()));
        }
        Ok(inner
            .order
            .iter()
            .filter_map(|source| inner.manifests.get(source).cloned())
            .collect())
    }

    fn fetch_model(
        &self,
        key: &StreamKey,
        hash: &ContentHash,
        cancel: &CancelToken,
    ) -> Result<SyncModel> {
        cancel.check()?;
        let inner = self.lock();
        inner
            .models
            .get(&(key.clone(), hash.clone()))
            .cloned()
            .ok_or_else(|| Error::Fetch(format!("no model for {key} at {hash}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectInstance;
    use crate::types::ModelKind;

    fn instance(id: &str, object_id: &str) -> SyncModel {
        SyncModel::Instance(ObjectInstance {
            id: id.into(),
            name: id.into(),
            object_id: object_id.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_cancel_token_trips_once() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_memory_provider_lists_in_insertion_order() {
        let provider = MemorySyncProvider::new();
        provider.put("src-b", instance("i1", "o1"), "h1");
        provider.put("src-a", instance("i2", "o2"), "h2");

        let manifests = provider.list_manifests(&CancelToken::new()).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].source, "src-b");
        assert_eq!(manifests[1].source, "src-a");
    }

    #[test]
    fn test_memory_provider_fetch_by_version() {
        let provider = MemorySyncProvider::new();
        provider.put("src", instance("i1", "o1"), "h1");
        provider.put("src", instance("i1", "o2"), "h2");

        let key = StreamKey::new("src", ModelKind::Instance, "i1");
        let cancel = CancelToken::new();

        // Both published versions remain fetchable.
        let old = provider
            .fetch_model(&key, &ContentHash::from("h1"), &cancel)
            .unwrap();
        let new = provider
            .fetch_model(&key, &ContentHash::from("h2"), &cancel)
            .unwrap();
        assert!(matches!(old, SyncModel::Instance(ref m) if m.object_id == "o1"));
        assert!(matches!(new, SyncModel::Instance(ref m) if m.object_id == "o2"));

        let missing = provider.fetch_model(&key, &ContentHash::from("h9"), &cancel);
        assert!(matches!(missing, Err(Error::Fetch(_))));
    }

    #[test]
    fn test_memory_provider_list_error_injection() {
        let provider = MemorySyncProvider::new();
        provider.put("src", instance("i1", "o1"), "h1");
        provider.set_list_error(Some("backend offline"));
        assert!(matches!(
            provider.list_manifests(&CancelToken::new()),
            Err(Error::Fetch(_))
        ));

        provider.set_list_error(None);
        assert!(provider.list_manifests(&CancelToken::new()).is_ok());
    }

    #[test]
    fn test_cancelled_fetch_short_circuits() {
        let provider = MemorySyncProvider::new();
        provider.put("src", instance("i1", "o1"), "h1");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            provider.list_manifests(&cancel),
            Err(Error::Cancelled)
        ));
    }
}
