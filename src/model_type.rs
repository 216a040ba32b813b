//! The model-type registry: a mapping from a resource id's two-segment type
//! prefix to a factory that builds the [`crate::resource::Model`] for that
//! prefix, plus an optional custom change handler.
//!
//! This replaces subclass polymorphism (dynamic dispatch keyed off a
//! prototype object) with a plain registry lookup, the idiomatic Rust
//! equivalent called out in the design notes.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::client::ClientFacade;
use crate::error::Error;
use crate::resource::Model;
use crate::rid::{is_valid_model_type_id, type_prefix};

pub type ModelFactory =
    Rc<dyn Fn(&ClientFacade, &str, HashMap<String, Value>) -> Model>;

/// Delegate for the `change` event, replacing the default generic
/// key-wise merge. Returns the changed-key -> old-value map, same contract
/// as [`crate::resource::Model::update`].
pub type ChangeHandler = Rc<
    dyn Fn(&ClientFacade, &mut Model, HashMap<String, Option<Value>>) -> HashMap<String, Option<Value>>,
>;

#[derive(Clone)]
pub struct ModelType {
    pub id: String,
    pub factory: ModelFactory,
    pub change: Option<ChangeHandler>,
}

fn default_factory() -> ModelFactory {
    Rc::new(|client, rid, data| Model::new(client, rid, data))
}

#[derive(Clone)]
pub struct ModelTypeRegistry {
    types: HashMap<String, ModelType>,
    default: ModelType,
}

impl Default for ModelTypeRegistry {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
            default: ModelType {
                id: "*".to_string(),
                factory: default_factory(),
                change: None,
            },
        }
    }
}

impl ModelTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model_type`. Fails if `model_type.id` is not
    /// `segment.segment`, or an entry with that id already exists.
    pub fn register(&mut self, model_type: ModelType) -> Result<(), Error> {
        if !is_valid_model_type_id(&model_type.id) {
            return Err(Error::Config(format!(
                "model type id {:?} must match `segment.segment`",
                model_type.id
            )));
        }
        if self.types.contains_key(&model_type.id) {
            return Err(Error::Config(format!(
                "model type {:?} is already registered",
                model_type.id
            )));
        }
        self.types.insert(model_type.id.clone(), model_type);
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> Option<ModelType> {
        self.types.remove(id)
    }

    /// Resolves the model type for `rid` by its two-segment type prefix,
    /// falling back to the default factory when no prefix matches.
    pub fn resolve(&self, rid: &str) -> &ModelType {
        self.types
            .get(type_prefix(rid))
            .unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_malformed_and_duplicate_ids() {
        let mut reg = ModelTypeRegistry::new();
        let mt = |id: &str| ModelType {
            id: id.to_string(),
            factory: default_factory(),
            change: None,
        };
        assert!(reg.register(mt("bad")).is_err());
        assert!(reg.register(mt("svc.x")).is_ok());
        assert!(reg.register(mt("svc.x")).is_err());
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let mut reg = ModelTypeRegistry::new();
        reg.register(ModelType {
            id: "user.profile".to_string(),
            factory: default_factory(),
            change: None,
        })
        .unwrap();
        assert_eq!(reg.resolve("user.profile.42").id, "user.profile");
        assert_eq!(reg.resolve("other.thing.1").id, "*");
    }
}
