//! Reconciles cached resource values against server-pushed events: `change`
//! for models, and `add`/`remove` (plus the stale-resubscribe full
//! resnapshot) for collections.
//!
//! A collection resync diffs the cached ordering against a fresh snapshot
//! with a longest-common-subsequence algorithm, emitting the minimal set of
//! synthetic `remove`/`add` events needed to walk from the old order to the
//! new one — the same event shapes a live `add`/`remove` push produces, so
//! callers never have to special-case a resync.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::cache::{CacheItem, ModelHandle, ResourceCache};
use crate::client::ClientFacade;
use crate::error::Error;
use crate::eventbus::EventBus;
use crate::model_type::ModelType;
use crate::resource::{Collection, Identified};

pub struct SyncEngine;

impl SyncEngine {
    /// Applies a `change` event's delta to the model cached at `rid`.
    ///
    /// Delegates to the model type's custom change handler if one is
    /// registered; otherwise merges key-wise via [`Model::update`]. Emits
    /// `change` on the event bus with the changed-key -> old-value map,
    /// unless that map is empty.
    pub fn handle_change_event(
        client: &ClientFacade,
        event_bus: &dyn EventBus,
        model: &ModelHandle,
        model_type: &ModelType,
        raw_delta: &serde_json::Map<String, Value>,
    ) -> Result<(), Error> {
        let mut delta = HashMap::with_capacity(raw_delta.len());
        for (key, value) in raw_delta {
            let resolved = match value {
                Value::Object(obj) if obj.get("action").and_then(Value::as_str) == Some("delete") => {
                    None
                }
                Value::Object(obj) if obj.contains_key("action") => {
                    return Err(Error::protocol(format!(
                        "unsupported change action in delta for key {key:?}"
                    )));
                }
                other => Some(other.clone()),
            };
            delta.insert(key.clone(), resolved);
        }

        let changed = if let Some(handler) = &model_type.change {
            let mut guard = model.borrow_mut();
            handler(client, &mut guard, delta)
        } else {
            model.borrow_mut().update(delta)
        };

        if !changed.is_empty() {
            let rid = model.rid();
            let payload = serde_json::to_value(&changed).unwrap_or(Value::Null);
            event_bus.emit(&rid, "change", &payload);
        }
        Ok(())
    }

    /// Applies a live `add` push: inserts the model built from `payload` at
    /// `idx` and emits `add`.
    pub fn handle_add_event(
        cache: &ResourceCache,
        client: &ClientFacade,
        event_bus: &dyn EventBus,
        collection: &Rc<RefCell<Collection<ModelHandle>>>,
        collection_rid: &str,
        idx: usize,
        rid: &str,
        data: Value,
    ) -> Result<(), Error> {
        let item = if cache.contains(rid) {
            cache.get(rid).unwrap().item().ok_or_else(|| {
                Error::cache_integrity(rid, "referenced by add but not yet bound")
            })?
        } else {
            let registry_snapshot = client.model_type_registry_snapshot();
            cache.ingest_snapshot(rid, data, true, client, &registry_snapshot)?
        };
        let model = item
            .as_model()
            .cloned()
            .ok_or_else(|| Error::protocol(format!("add target {rid} is not a model")))?;
        cache.add_indirect(rid);
        collection.borrow_mut().add(model, idx)?;
        event_bus.emit(collection_rid, "add", &serde_json::json!({"idx": idx, "rid": rid}));
        Ok(())
    }

    /// Applies a live `remove` push: removes the element at `idx` and emits
    /// `remove`, then drops the removed child's indirect reference (possibly
    /// releasing it).
    pub fn handle_remove_event(
        cache: &ResourceCache,
        client: &ClientFacade,
        event_bus: &dyn EventBus,
        collection: &Rc<RefCell<Collection<ModelHandle>>>,
        collection_rid: &str,
        idx: usize,
    ) -> Result<(), Error> {
        let removed = collection
            .borrow_mut()
            .remove(idx)
            .ok_or_else(|| Error::cache_integrity(collection_rid, "remove index out of range"))?;
        let removed_rid = removed.rid();
        event_bus.emit(
            collection_rid,
            "remove",
            &serde_json::json!({"idx": idx, "rid": removed_rid}),
        );
        cache.remove_indirect(&removed_rid);
        if let Some(entry) = cache.get(&removed_rid) {
            let outcome = cache.try_release(&entry);
            client.handle_release_outcome(&entry, outcome);
        }
        Ok(())
    }

    /// Resyncs a stale collection against a fresh full snapshot, computing
    /// the minimal ordered sequence of remove/add operations via an LCS diff
    /// and emitting them exactly as a live push would.
    ///
    /// Order: all removes implied by the diff are emitted first (from
    /// highest index to lowest, so earlier removals don't shift the indices
    /// of later ones), then all adds (from lowest index to highest). At an
    /// equal matched index, remove is preferred over add to keep the diff
    /// minimal, per the design note on tie-breaking.
    pub fn resync_collection(
        cache: &ResourceCache,
        client: &ClientFacade,
        event_bus: &dyn EventBus,
        collection_rid: &str,
        collection: &Rc<RefCell<Collection<ModelHandle>>>,
        fresh: Vec<Value>,
    ) -> Result<(), Error> {
        let old_rids: Vec<String> = collection.borrow().iter().map(|m| m.rid()).collect();
        let mut fresh_entries = Vec::with_capacity(fresh.len());
        for element in fresh {
            let obj = element
                .as_object()
                .ok_or_else(|| Error::protocol("collection element is not an object"))?;
            let rid = obj
                .get("rid")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol("collection element missing rid"))?
                .to_string();
            let data = obj.get("data").cloned().unwrap_or(Value::Null);
            fresh_entries.push((rid, data));
        }
        let new_rids: Vec<String> = fresh_entries.iter().map(|(rid, _)| rid.clone()).collect();

        let ops = diff_by_lcs(&old_rids, &new_rids);

        // Elements present in both sequences keep their cache entry and
        // identity; if the fresh snapshot still carries a data block for
        // one of them, that's the server pushing an update bundled into
        // the resync rather than a separate `change` event, so route it
        // through the same ingest path a nested child uses.
        let unchanged_rids: std::collections::HashSet<&str> = old_rids
            .iter()
            .map(String::as_str)
            .filter(|rid| new_rids.iter().any(|n| n == rid))
            .collect();
        for (rid, data) in &fresh_entries {
            if !unchanged_rids.contains(rid.as_str()) || data.is_null() {
                continue;
            }
            if let Some(entry) = cache.get(rid) {
                if let Some(CacheItem::Model(model)) = entry.item() {
                    let obj = data
                        .as_object()
                        .ok_or_else(|| Error::protocol("unchanged element data is not an object"))?;
                    let model_type = entry.model_type().unwrap_or_else(|| client.model_type_registry_snapshot().resolve(rid).clone());
                    Self::handle_change_event(client, event_bus, &model, &model_type, obj)?;
                }
            }
        }

        for op in ops.iter().rev() {
            if let DiffOp::Remove { old_idx } = op {
                Self::handle_remove_event(cache, client, event_bus, collection, collection_rid, *old_idx)?;
            }
        }
        for op in &ops {
            if let DiffOp::Add { new_idx, rid } = op {
                let data = fresh_entries
                    .iter()
                    .find(|(r, _)| r == rid)
                    .map(|(_, d)| d.clone())
                    .unwrap_or(Value::Null);
                Self::handle_add_event(
                    cache,
                    client,
                    event_bus,
                    collection,
                    collection_rid,
                    *new_idx,
                    rid,
                    data,
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum DiffOp {
    Remove { old_idx: usize },
    Add { new_idx: usize, rid: String },
}

/// Longest-common-subsequence diff between `old` and `new` id sequences,
/// trimmed at matching prefix/suffix runs first since those never need to be
/// touched and trimming keeps the DP table small for the common case of a
/// small change in a large collection.
fn diff_by_lcs(old: &[String], new: &[String]) -> Vec<DiffOp> {
    let mut start = 0;
    while start < old.len() && start < new.len() && old[start] == new[start] {
        start += 1;
    }
    let mut old_end = old.len();
    let mut new_end = new.len();
    while old_end > start && new_end > start && old[old_end - 1] == new[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let old_mid = &old[start..old_end];
    let new_mid = &new[start..new_end];

    let m = old_mid.len();
    let n = new_mid.len();
    let mut dp = vec![vec![0u32; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            dp[i][j] = if old_mid[i] == new_mid[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < m && j < n {
        if old_mid[i] == new_mid[j] {
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            ops.push(DiffOp::Remove {
                old_idx: start + i,
            });
            i += 1;
        } else {
            ops.push(DiffOp::Add {
                new_idx: start + j,
                rid: new_mid[j].clone(),
            });
            j += 1;
        }
    }
    while i < m {
        ops.push(DiffOp::Remove {
            old_idx: start + i,
        });
        i += 1;
    }
    while j < n {
        ops.push(DiffOp::Add {
            new_idx: start + j,
            rid: new_mid[j].clone(),
        });
        j += 1;
    }

    // Adds must be applied in ascending new_idx order for sequential
    // insertion into the live list to land each element at the right final
    // position; the DP walk above already produces them in that order for
    // each op type, so only a stable separation is needed, which the two
    // passes over `ops` at the call site already provide.
    ops
}
