//! Live, observable resource values: [`Model`] (a key/value snapshot) and
//! [`Collection`] (an ordered sequence of models identified by rid).
//!
//! Mutation hooks (`update`, `add`, `remove`, `init`) are `pub(crate)`: they
//! are part of the contract [`crate::sync::SyncEngine`] relies on, not the
//! public API. Callers read these values and attach listeners directly
//! through `on`/`off`, which are thin, rid-scoped wrappers around
//! [`crate::client::ClientFacade::add_direct_listener`]/`release`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::client::{ClientFacade, WeakClientFacade};
use crate::error::Error;
use crate::eventbus::HandlerId;

/// A single resource's key/value snapshot.
#[derive(Debug, Clone, Default)]
pub struct Model {
    rid: String,
    data: HashMap<String, Value>,
    client: WeakClientFacade,
}

impl Model {
    pub fn new(client: &ClientFacade, rid: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            rid: rid.into(),
            data,
            client: client.downgrade(),
        }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Applies `delta` in place. `None` values in `delta` represent the wire
    /// delete sentinel and remove the key; `Some` values set/replace it.
    ///
    /// Returns the map of changed-key -> old-value (absent keys represented
    /// as `Value::Null` is NOT used here; a deleted key's old value is
    /// whatever it held before removal, and a newly-inserted key has no old
    /// value, represented by `None` in the returned map's value).
    pub(crate) fn update(&mut self, delta: HashMap<String, Option<Value>>) -> HashMap<String, Option<Value>> {
        let mut changed = HashMap::new();
        for (key, new_value) in delta {
            match new_value {
                Some(v) => {
                    let old = self.data.insert(key.clone(), v.clone());
                    if old.as_ref() != Some(&v) {
                        changed.insert(key, old);
                    }
                }
                None => {
                    if let Some(old) = self.data.remove(&key) {
                        changed.insert(key, Some(old));
                    }
                }
            }
        }
        changed
    }

    /// Attaches `handler` for `events` (e.g. `"change"`) scoped to this
    /// model's rid. Returns `None` if the owning client has already been
    /// dropped. Pairs with [`Model::off`].
    pub fn on(&self, events: &str, handler: Box<dyn FnMut(&Value)>) -> Option<HandlerId> {
        let client = self.client.upgrade()?;
        Some(client.add_direct_listener(&self.rid, events, handler))
    }

    /// Detaches `handler` from `events`, mirroring [`Model::on`]. Runs the
    /// release teardown (possible unsubscribe, cache GC) in the background,
    /// the same fire-and-forget shape as `ClientFacade::disconnect`.
    pub fn off(&self, events: &str, handler: HandlerId) {
        let Some(client) = self.client.upgrade() else { return };
        let rid = self.rid.clone();
        let events = events.to_string();
        tokio::task::spawn_local(async move {
            client.release(&rid, &events, handler).await;
        });
    }
}

/// An ordered sequence of [`Model`]s (or, recursively, of other resource
/// values behind an id), identified by each element's rid.
#[derive(Debug, Clone, Default)]
pub struct Collection<T> {
    rid: String,
    list: Vec<T>,
    id_index: Option<HashMap<String, usize>>,
    client: WeakClientFacade,
}

/// Anything that can be identified by an rid, so a [`Collection`] can build
/// a secondary id -> index lookup. Returns an owned `String` rather than
/// `&str`: collection elements are typically `Rc<RefCell<Model>>`, and
/// borrowing the `RefCell` to hand back a reference would tie the return
/// value's lifetime to a temporary borrow guard.
pub trait Identified {
    fn rid(&self) -> String;
}

impl Identified for Rc<RefCell<Model>> {
    fn rid(&self) -> String {
        self.borrow().rid().to_string()
    }
}

impl<T: Identified> Collection<T> {
    pub fn new(client: &ClientFacade, rid: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            list: Vec::new(),
            id_index: None,
            client: client.downgrade(),
        }
    }

    /// Attaches `handler` for `events` (e.g. `"add remove move"`) scoped to
    /// this collection's rid. Returns `None` if the owning client has
    /// already been dropped. Pairs with [`Collection::off`].
    pub fn on(&self, events: &str, handler: Box<dyn FnMut(&Value)>) -> Option<HandlerId> {
        let client = self.client.upgrade()?;
        Some(client.add_direct_listener(&self.rid, events, handler))
    }

    /// Detaches `handler` from `events`, mirroring [`Collection::on`]. Runs
    /// the release teardown in the background, same as [`Model::off`].
    pub fn off(&self, events: &str, handler: HandlerId) {
        let Some(client) = self.client.upgrade() else { return };
        let rid = self.rid.clone();
        let events = events.to_string();
        tokio::task::spawn_local(async move {
            client.release(&rid, &events, handler).await;
        });
    }

    /// Enables the secondary id-lookup map. Fails if the current contents
    /// already contain a duplicate id.
    pub fn with_id_index(mut self) -> Result<Self, Error> {
        let mut index = HashMap::with_capacity(self.list.len());
        for (i, item) in self.list.iter().enumerate() {
            if index.insert(item.rid().to_string(), i).is_some() {
                return Err(Error::protocol(format!(
                    "duplicate id {} in collection {}",
                    item.rid(),
                    self.rid
                )));
            }
        }
        self.id_index = Some(index);
        Ok(self)
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn at_index(&self, idx: usize) -> Option<&T> {
        self.list.get(idx)
    }

    pub fn to_vec(&self) -> Vec<&T> {
        self.list.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.list.iter()
    }

    pub fn index_of_rid(&self, rid: &str) -> Option<usize> {
        if let Some(index) = &self.id_index {
            return index.get(rid).copied();
        }
        self.list.iter().position(|item| item.rid() == rid)
    }

    /// Replaces the collection's contents wholesale. Used when a cache entry
    /// first binds to an rid.
    pub(crate) fn init(&mut self, items: Vec<T>) -> Result<(), Error> {
        if let Some(ref mut index) = self.id_index {
            index.clear();
            for (i, item) in items.iter().enumerate() {
                if index.insert(item.rid().to_string(), i).is_some() {
                    return Err(Error::protocol(format!(
                        "duplicate id {} in collection {}",
                        item.rid(),
                        self.rid
                    )));
                }
            }
        }
        self.list = items;
        Ok(())
    }

    /// Inserts `item` at `idx`, keyed by its own rid.
    pub(crate) fn add(&mut self, item: T, idx: usize) -> Result<(), Error> {
        let rid = item.rid().to_string();
        if let Some(ref index) = self.id_index {
            if index.contains_key(&rid) {
                return Err(Error::protocol(format!(
                    "duplicate id {rid} inserted into collection {}",
                    self.rid
                )));
            }
        }
        self.list.insert(idx, item);
        if let Some(ref mut index) = self.id_index {
            for (i, existing) in self.list.iter().enumerate().skip(idx) {
                index.insert(existing.rid().to_string(), i);
            }
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Option<T> {
        if idx >= self.list.len() {
            return None;
        }
        let removed = self.list.remove(idx);
        if let Some(ref mut index) = self.id_index {
            index.remove(removed.rid().as_str());
            for (i, existing) in self.list.iter().enumerate().skip(idx) {
                index.insert(existing.rid().to_string(), i);
            }
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_update_distinguishes_delete_from_set() {
        let client = ClientFacade::test_instance();
        let mut m = Model::new(&client, "m.1", HashMap::from([("a".into(), Value::from(1))]));
        let mut delta = HashMap::new();
        delta.insert("a".to_string(), None);
        delta.insert("b".to_string(), Some(Value::from(2)));
        let changed = m.update(delta);
        assert!(!m.contains_key("a"));
        assert_eq!(m.get("b"), Some(&Value::from(2)));
        assert_eq!(changed.get("a"), Some(&Some(Value::from(1))));
        assert_eq!(changed.get("b"), Some(&None));
    }

    #[test]
    fn model_update_is_noop_for_unchanged_value() {
        let client = ClientFacade::test_instance();
        let mut m = Model::new(&client, "m.1", HashMap::from([("a".into(), Value::from(1))]));
        let mut delta = HashMap::new();
        delta.insert("a".to_string(), Some(Value::from(1)));
        let changed = m.update(delta);
        assert!(changed.is_empty());
    }

    fn model_handle(client: &ClientFacade, rid: &str) -> Rc<RefCell<Model>> {
        Rc::new(RefCell::new(Model::new(client, rid, HashMap::new())))
    }

    #[test]
    fn collection_add_remove_maintains_id_index() {
        let client = ClientFacade::test_instance();
        let mut c: Collection<Rc<RefCell<Model>>> =
            Collection::new(&client, "rooms").with_id_index().unwrap();
        c.init(vec![
            model_handle(&client, "room.1"),
            model_handle(&client, "room.2"),
        ])
        .unwrap();
        assert_eq!(c.index_of_rid("room.2"), Some(1));
        c.add(model_handle(&client, "room.3"), 1).unwrap();
        assert_eq!(c.index_of_rid("room.3"), Some(1));
        assert_eq!(c.index_of_rid("room.2"), Some(2));
        let removed = c.remove(0).unwrap();
        assert_eq!(removed.rid(), "room.1");
        assert_eq!(c.index_of_rid("room.3"), Some(0));
    }

    #[test]
    fn collection_rejects_duplicate_ids() {
        let client = ClientFacade::test_instance();
        let c: Collection<Rc<RefCell<Model>>> = Collection::new(&client, "rooms");
        let mut c = c.with_id_index().unwrap();
        c.init(vec![model_handle(&client, "room.1")]).unwrap();
        assert!(c.add(model_handle(&client, "room.1"), 0).is_err());
    }

    #[tokio::test]
    async fn model_on_returns_none_once_the_client_is_dropped() {
        let model = {
            let client = ClientFacade::test_instance();
            model_handle(&client, "room.1")
        };
        assert!(model.borrow().on("change", Box::new(|_| {})).is_none());
    }
}
