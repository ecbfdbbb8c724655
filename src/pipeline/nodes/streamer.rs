//! Root node: fetches manifests, diffs them, streams the changes.

use crate::error::{Error, Result};
use crate::model::ManifestEntry;
use crate::pipeline::node::{
    NodeContext, NodeDescriptor, Processor, SharedState, ThreadAffinity,
};
use crate::pipeline::payload::{AssetRef, Payload};
use crate::pipeline::port::{ParamKind, PortDescriptor, PayloadKind};
use crate::provider::SyncModelProvider;
use crate::types::{Aabb, ContentHash, StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

static PORTS: &[PortDescriptor] = &[PortDescriptor::output("assets", PayloadKind::Asset)];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "ProjectStreamer",
    ports: PORTS,
    params: &[],
    provides: &[ParamKind::HashIndex],
    affinity: ThreadAffinity::Caller,
    is_root: true,
};

const OUT_ASSETS: u16 = 0;

/// Shared manifest lookup served to parameter slots.
pub type HashIndexHandle = Arc<Mutex<ManifestIndex>>;

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    hash: ContentHash,
    bounds: Option<Aabb>,
}

/// Hash lookup over the currently retained manifests.
#[derive(Debug, Default)]
pub struct ManifestIndex {
    sources: HashMap<String, HashMap<StreamKey, IndexEntry>>,
}

impl ManifestIndex {
    pub fn hash_of(&self, key: &StreamKey) -> Option<ContentHash> {
        self.sources
            .get(&key.source)
            .and_then(|entries| entries.get(key))
            .map(|e| e.hash.clone())
    }

    pub fn bounds_of(&self, key: &StreamKey) -> Option<Aabb> {
        self.sources
            .get(&key.source)
            .and_then(|entries| entries.get(key))
            .and_then(|e| e.bounds)
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, key: StreamKey, hash: ContentHash) {
        self.sources
            .entry(key.source.clone())
            .or_default()
            .insert(key, IndexEntry { hash, bounds: None });
    }

    fn commit_source(&mut self, source: &str, entries: &[ManifestEntry]) {
        let bucket = self.sources.entry(source.to_owned()).or_default();
        bucket.clear();
        for entry in entries {
            bucket.insert(
                entry.key.clone(),
                IndexEntry {
                    hash: entry.hash.clone(),
                    bounds: entry.bounds,
                },
            );
        }
    }
}

/// Streamer phases within one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Idle,
    Fetching,
    Diffing,
    Streaming,
}

/// Per-source diff against the retained manifest.
#[derive(Debug, Default)]
pub(crate) struct ManifestDiff {
    pub added: Vec<ManifestEntry>,
    pub changed: Vec<ManifestEntry>,
    pub removed: Vec<ManifestEntry>,
}

/// Symmetric difference by content hash.
///
/// Added and changed entries keep the new manifest's order; removed entries
/// are sorted by key so the result is deterministic regardless of map
/// iteration order.
pub(crate) fn compute_diff(
    retained: &HashMap<StreamKey, IndexEntry>,
    entries: &[ManifestEntry],
) -> ManifestDiff {
    let mut diff = ManifestDiff::default();
    for entry in entries {
        match retained.get(&entry.key) {
            None => diff.added.push(entry.clone()),
            Some(old) if old.hash != entry.hash => diff.changed.push(entry.clone()),
            Some(_) => {}
        }
    }
    let new_keys: std::collections::HashSet<&StreamKey> = entries.iter().map(|e| &e.key).collect();
    let mut removed: Vec<ManifestEntry> = retained
        .iter()
        .filter(|(key, _)| !new_keys.contains(key))
        .map(|(key, old)| ManifestEntry {
            key: key.clone(),
            hash: old.hash.clone(),
            bounds: old.bounds,
        })
        .collect();
    removed.sort_by(|a, b| a.key.cmp(&b.key));
    diff.removed = removed;
    diff
}

/// The root processor: manifest fetch, diff, event emission.
pub struct ProjectStreamer {
    provider: Arc<dyn SyncModelProvider>,
    index: HashIndexHandle,
    retained: HashMap<String, HashMap<StreamKey, IndexEntry>>,
    state: StreamerState,
}

impl ProjectStreamer {
    pub fn new(provider: Arc<dyn SyncModelProvider>) -> Self {
        Self {
            provider,
            index: Arc::new(Mutex::new(ManifestIndex::default())),
            retained: HashMap::new(),
            state: StreamerState::Idle,
        }
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    fn emit_entry(
        ctx: &mut NodeContext<'_>,
        entry: &ManifestEntry,
        event: StreamEvent,
    ) {
        let data = SyncedData::new(
            entry.key.clone(),
            entry.hash.clone(),
            Payload::Asset(AssetRef {
                bounds: entry.bounds,
            }),
        );
        ctx.out.send(OUT_ASSETS, data, event);
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, ManifestIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Processor for ProjectStreamer {
    fn refresh(&mut self, ctx: &mut NodeContext<'_>) -> Result<()> {
        let started = Instant::now();
        self.state = StreamerState::Fetching;

        let manifests = match self.provider.list_manifests(ctx.cancel) {
            Ok(manifests) => manifests,
            Err(err) => {
                // Recoverable: retained state untouched, no internal retry.
                self.state = StreamerState::Idle;
                warn!(error = %err, "manifest listing failed");
                return Err(err);
            }
        };
        let fetched = started.elapsed();

        if let Err(err) = ctx.cancel.check() {
            self.state = StreamerState::Idle;
            return Err(err);
        }

        self.state = StreamerState::Diffing;
        let empty = HashMap::new();
        let diffs: Vec<_> = manifests
            .iter()
            .map(|m| {
                let retained = self.retained.get(&m.source).unwrap_or(&empty);
                compute_diff(retained, &m.entries)
            })
            .collect();
        let diffed = started.elapsed();

        self.state = StreamerState::Streaming;
        ctx.out.begin(OUT_ASSETS);
        let mut counts = (0usize, 0usize, 0usize);
        for diff in &diffs {
            for entry in &diff.added {
                Self::emit_entry(ctx, entry, StreamEvent::Added);
            }
            for entry in &diff.changed {
                Self::emit_entry(ctx, entry, StreamEvent::Changed);
            }
            for entry in &diff.removed {
                Self::emit_entry(ctx, entry, StreamEvent::Removed);
            }
            counts.0 += diff.added.len();
            counts.1 += diff.changed.len();
            counts.2 += diff.removed.len();
        }
        ctx.out.end(OUT_ASSETS);

        // Commit only after the full diff stream is assembled. Retained
        // state first, then the shared index under its lock.
        for manifest in &manifests {
            let bucket = self.retained.entry(manifest.source.clone()).or_default();
            bucket.clear();
            for entry in &manifest.entries {
                bucket.insert(
                    entry.key.clone(),
                    IndexEntry {
                        hash: entry.hash.clone(),
                        bounds: entry.bounds,
                    },
                );
            }
        }
        {
            let mut index = self.lock_index();
            for manifest in &manifests {
                index.commit_source(&manifest.source, &manifest.entries);
            }
        }
        self.state = StreamerState::Idle;

        info!(
            sources = manifests.len(),
            added = counts.0,
            changed = counts.1,
            removed = counts.2,
            "manifest refresh complete"
        );
        debug!(
            fetch_ms = fetched.as_millis() as u64,
            diff_ms = (diffed - fetched).as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "refresh timing"
        );
        Ok(())
    }

    fn on_event(
        &mut self,
        _port: u16,
        _data: &SyncedData<Payload>,
        _event: StreamEvent,
        _ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        Err(Error::InvalidState {
            expected: "no inputs on the streamer",
            actual: "incoming event",
        })
    }

    fn shared_state(&self) -> Option<SharedState> {
        Some(SharedState::HashIndex(self.index.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectInstance, SyncModel};
    use crate::pipeline::node::{Emission, Emitter};
    use crate::provider::{CancelToken, MemorySyncProvider};
    use crate::types::ModelKind;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn instance(id: &str) -> SyncModel {
        SyncModel::Instance(ObjectInstance {
            id: id.into(),
            name: id.into(),
            object_id: format!("{id}-object"),
            ..Default::default()
        })
    }

    #[derive(Debug)]
    struct Pass {
        begins: usize,
        ends: usize,
        added: Vec<StreamKey>,
        changed: Vec<StreamKey>,
        removed: Vec<StreamKey>,
    }

    fn run_refresh(streamer: &mut ProjectStreamer) -> Result<Pass> {
        let mut emitter = Emitter::new();
        let cancel = CancelToken::new();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel: &cancel,
        };
        streamer.refresh(&mut ctx)?;

        let mut pass = Pass {
            begins: 0,
            ends: 0,
            added: Vec::new(),
            changed: Vec::new(),
            removed: Vec::new(),
        };
        for emission in emitter.take() {
            match emission {
                Emission::Begin { .. } => pass.begins += 1,
                Emission::End { .. } => pass.ends += 1,
                Emission::Event { data, event, .. } => match event {
                    StreamEvent::Added => pass.added.push(data.key),
                    StreamEvent::Changed => pass.changed.push(data.key),
                    StreamEvent::Removed => pass.removed.push(data.key),
                },
            }
        }
        Ok(pass)
    }

    #[test]
    fn test_first_refresh_streams_everything_as_added() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src-a", instance("i1"), "h1");
        provider.put("src-a", instance("i2"), "h2");

        let mut streamer = ProjectStreamer::new(provider);
        let pass = run_refresh(&mut streamer).unwrap();

        assert_eq!(pass.begins, 1);
        assert_eq!(pass.ends, 1);
        assert_eq!(pass.added.len(), 2);
        assert!(pass.changed.is_empty());
        assert!(pass.removed.is_empty());
        assert_eq!(streamer.state(), StreamerState::Idle);
    }

    #[test]
    fn test_hash_change_and_new_key() {
        // A = {k1: h1}  →  B = {k1: h2, k2: h3}  ⇒  Changed(k1), Added(k2).
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("k1"), "h1");

        let mut streamer = ProjectStreamer::new(provider.clone());
        run_refresh(&mut streamer).unwrap();

        provider.put("src", instance("k1"), "h2");
        provider.put("src", instance("k2"), "h3");
        let pass = run_refresh(&mut streamer).unwrap();

        assert_eq!(
            pass.changed,
            vec![StreamKey::new("src", ModelKind::Instance, "k1")]
        );
        assert_eq!(
            pass.added,
            vec![StreamKey::new("src", ModelKind::Instance, "k2")]
        );
        assert!(pass.removed.is_empty());
    }

    #[test]
    fn test_removal_is_streamed_then_forgotten() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");
        provider.put("src", instance("i2"), "h2");

        let mut streamer = ProjectStreamer::new(provider.clone());
        run_refresh(&mut streamer).unwrap();

        provider.remove("src", ModelKind::Instance, "i1");
        let pass = run_refresh(&mut streamer).unwrap();
        assert_eq!(
            pass.removed,
            vec![StreamKey::new("src", ModelKind::Instance, "i1")]
        );

        // Removing an already-removed key yields nothing further.
        let pass = run_refresh(&mut streamer).unwrap();
        assert!(pass.removed.is_empty());
    }

    #[test]
    fn test_identical_replay_emits_zero_events() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");

        let mut streamer = ProjectStreamer::new(provider);
        run_refresh(&mut streamer).unwrap();
        let pass = run_refresh(&mut streamer).unwrap();

        assert_eq!(pass.added.len() + pass.changed.len() + pass.removed.len(), 0);
        // Framing still brackets the (empty) pass.
        assert_eq!(pass.begins, 1);
        assert_eq!(pass.ends, 1);
    }

    #[test]
    fn test_fetch_error_is_recoverable() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");

        let mut streamer = ProjectStreamer::new(provider.clone());
        provider.set_list_error(Some("offline"));
        let err = run_refresh(&mut streamer).unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert_eq!(streamer.state(), StreamerState::Idle);

        // Retained state was untouched: the next refresh streams everything.
        provider.set_list_error(None);
        let pass = run_refresh(&mut streamer).unwrap();
        assert_eq!(pass.added.len(), 1);
    }

    #[test]
    fn test_cancellation_leaves_state_unchanged() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");

        let mut streamer = ProjectStreamer::new(provider);
        let mut emitter = Emitter::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel: &cancel,
        };
        let err = streamer.refresh(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(emitter.is_empty());
        assert_eq!(streamer.state(), StreamerState::Idle);
    }

    #[test]
    fn test_index_reflects_committed_manifest() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");

        let mut streamer = ProjectStreamer::new(provider);
        let handle = match streamer.shared_state() {
            Some(SharedState::HashIndex(h)) => h,
            _ => panic!("streamer must provide a hash index"),
        };
        let key = StreamKey::new("src", ModelKind::Instance, "i1");
        assert!(handle.lock().unwrap().hash_of(&key).is_none());

        run_refresh(&mut streamer).unwrap();
        assert_eq!(
            handle.lock().unwrap().hash_of(&key),
            Some(ContentHash::from("h1"))
        );
    }

    #[test]
    fn test_commit_updates_retained_and_index_together() {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", instance("i1"), "h1");

        let mut streamer = ProjectStreamer::new(provider.clone());
        let handle = match streamer.shared_state() {
            Some(SharedState::HashIndex(h)) => h,
            _ => panic!("streamer must provide a hash index"),
        };
        run_refresh(&mut streamer).unwrap();

        provider.put("src", instance("i1"), "h2");
        let pass = run_refresh(&mut streamer).unwrap();
        assert_eq!(pass.changed.len(), 1);

        // Both sides of the commit see the new hash.
        let key = StreamKey::new("src", ModelKind::Instance, "i1");
        assert_eq!(
            handle.lock().unwrap().hash_of(&key),
            Some(ContentHash::from("h2"))
        );
        let replay = run_refresh(&mut streamer).unwrap();
        assert!(replay.changed.is_empty());
    }

    proptest! {
        /// The diff is exactly the symmetric difference by hash.
        #[test]
        fn prop_diff_is_symmetric_difference(
            old in proptest::collection::hash_map("[a-d]{1,2}", "[hx][0-9]", 0..8),
            new in proptest::collection::hash_map("[a-d]{1,2}", "[hx][0-9]", 0..8),
        ) {
            let retained: HashMap<StreamKey, IndexEntry> = old
                .iter()
                .map(|(id, hash)| {
                    (
                        StreamKey::new("s", ModelKind::Mesh, id.clone()),
                        IndexEntry { hash: ContentHash::new(hash.clone()), bounds: None },
                    )
                })
                .collect();
            let entries: Vec<ManifestEntry> = new
                .iter()
                .map(|(id, hash)| ManifestEntry {
                    key: StreamKey::new("s", ModelKind::Mesh, id.clone()),
                    hash: ContentHash::new(hash.clone()),
                    bounds: None,
                })
                .collect();

            let diff = compute_diff(&retained, &entries);

            let added: HashSet<_> = diff.added.iter().map(|e| e.key.id.clone()).collect();
            let changed: HashSet<_> = diff.changed.iter().map(|e| e.key.id.clone()).collect();
            let removed: HashSet<_> = diff.removed.iter().map(|e| e.key.id.clone()).collect();

            for (id, hash) in &new {
                match old.get(id) {
                    None => prop_assert!(added.contains(id)),
                    Some(h) if h != hash => prop_assert!(changed.contains(id)),
                    Some(_) => {
                        prop_assert!(!added.contains(id));
                        prop_assert!(!changed.contains(id));
                    }
                }
            }
            for id in old.keys() {
                prop_assert_eq!(removed.contains(id), !new.contains_key(id));
            }
            prop_assert_eq!(
                diff.added.len() + diff.changed.len() + diff.removed.len(),
                added.len() + changed.len() + removed.len()
            );
        }
    }
}
