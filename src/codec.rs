//! Wire codec: request/response correlation and event-name routing.
//!
//! Requests are newline-delimited JSON objects; two inbound shapes exist,
//! distinguished structurally rather than by a tag field: a response has an
//! `id`, an event has an `event` path. See the module docs on
//! [`crate::client::ClientFacade`] for how this sits between the transport
//! and the cache.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::{Error, ResourceError, TransportError};
use crate::rid::split_last_segment;

#[derive(Serialize)]
struct WireRequest<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Debug, serde::Deserialize)]
struct WireError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// An inbound frame, classified by [`ProtocolCodec::parse`].
#[derive(Debug)]
pub enum Inbound {
    Response {
        id: u64,
        result: Result<Value, (i64, String, Option<Value>)>,
    },
    Event {
        rid: String,
        name: String,
        data: Value,
    },
}

struct PendingRequest {
    method: String,
    params: Option<Value>,
    resolve: oneshot::Sender<Result<Value, Error>>,
}

/// Assigns monotonically increasing request ids, serializes outgoing
/// requests, and correlates inbound responses back to their caller.
#[derive(Default)]
pub struct ProtocolCodec {
    next_id: Cell<u64>,
    pending: RefCell<HashMap<u64, PendingRequest>>,
}

impl ProtocolCodec {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
        }
    }

    /// Reserves the next request id, registers a pending-request record, and
    /// returns `(id, wire text, receiver)`. The caller is responsible for
    /// actually writing `text` to the transport; if that fails, it must call
    /// [`ProtocolCodec::fail`] with the same id to avoid leaking the pending
    /// record.
    pub fn prepare_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> (u64, String, oneshot::Receiver<Result<Value, Error>>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let method = method.into();
        let wire = WireRequest {
            id,
            method: &method,
            params: params.as_ref(),
        };
        // `serde_json::Value`/primitives never fail to serialize; a failure
        // here would be a bug in `WireRequest`'s shape, not a runtime
        // condition callers need to handle.
        let text = serde_json::to_string(&wire).expect("WireRequest always serializes");
        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(
            id,
            PendingRequest {
                method,
                params,
                resolve: tx,
            },
        );
        (id, text, rx)
    }

    /// Parses an inbound text frame into a [`Inbound`] classification.
    pub fn parse(&self, text: &str) -> Result<Inbound, Error> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::protocol(format!("malformed JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::protocol("message is not a JSON object"))?;

        if let Some(id_value) = obj.get("id") {
            let id = id_value
                .as_u64()
                .ok_or_else(|| Error::protocol("response id is not a non-negative integer"))?;
            if let Some(error_value) = obj.get("error") {
                let werr: WireError = serde_json::from_value(error_value.clone())
                    .map_err(|e| Error::protocol(format!("malformed error object: {e}")))?;
                return Ok(Inbound::Response {
                    id,
                    result: Err((werr.code, werr.message, werr.data)),
                });
            }
            let result = obj.get("result").cloned().unwrap_or(Value::Null);
            return Ok(Inbound::Response {
                id,
                result: Ok(result),
            });
        }

        if let Some(event_value) = obj.get("event") {
            let event_path = event_value
                .as_str()
                .ok_or_else(|| Error::protocol("event path is not a string"))?;
            let (rid, name) = split_last_segment(event_path)
                .ok_or_else(|| Error::protocol(format!("malformed event name {event_path:?}")))?;
            let data = obj.get("data").cloned().unwrap_or(Value::Null);
            return Ok(Inbound::Event {
                rid: rid.to_string(),
                name: name.to_string(),
                data,
            });
        }

        Err(Error::protocol("message has neither `id` nor `event`"))
    }

    /// Resolves the pending request matching `id` with `result`. Returns the
    /// constructed [`ResourceError`] on the error path so the caller can emit
    /// a client-level `error` event; returns `Err` if no pending request
    /// matches (a protocol violation: response without matching request).
    pub fn complete(
        &self,
        id: u64,
        result: Result<Value, (i64, String, Option<Value>)>,
    ) -> Result<Option<ResourceError>, Error> {
        let pending = self
            .pending
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| Error::protocol(format!("response to unknown request id {id}")))?;
        match result {
            Ok(value) => {
                let _ = pending.resolve.send(Ok(value));
                Ok(None)
            }
            Err((code, message, data)) => {
                let err = ResourceError {
                    code,
                    message,
                    data,
                    method: pending.method,
                    params: pending.params,
                };
                let _ = pending.resolve.send(Err(Error::Resource(err.clone())));
                Ok(Some(err))
            }
        }
    }

    /// Drops a pending request without resolving it (used when writing the
    /// serialized request to the transport itself failed).
    pub fn fail(&self, id: u64, err: TransportError) {
        if let Some(pending) = self.pending.borrow_mut().remove(&id) {
            let _ = pending.resolve.send(Err(Error::Transport(err)));
        }
    }

    /// Fails every outstanding pending request, e.g. on transport close.
    /// Per the resolved open question in the design notes, pending RPCs do
    /// not survive a reconnect.
    pub fn fail_all(&self, err: TransportError) {
        for (_, pending) in self.pending.borrow_mut().drain() {
            let _ = pending.resolve.send(Err(Error::Transport(err.clone())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }
}

/// Convenience for building a `method` string of the form
/// `<verb>.<rid>[.<name>]`.
pub fn build_method(verb: &str, rid: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{verb}.{rid}.{name}"),
        None => format!("{verb}.{rid}"),
    }
}

/// Builds the wire `call`/`auth` params object, or `None` if `params` is
/// `Value::Null` and the caller wants to omit the field entirely.
pub fn wrap_params(params: Value) -> Option<Value> {
    if params.is_null() {
        None
    } else {
        Some(params)
    }
}

/// Translates a set-model payload's explicit-delete keys: a caller-facing
/// `None` (Rust's analogue of JS `undefined`) becomes the wire sentinel
/// `{"action": "delete"}`.
pub fn encode_set_params(props: HashMap<String, Option<Value>>) -> Value {
    let mut obj = serde_json::Map::with_capacity(props.len());
    for (key, value) in props {
        let wire_value = match value {
            Some(v) => v,
            None => json!({"action": "delete"}),
        };
        obj.insert(key, wire_value);
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_classifies_response_event_and_malformed() {
        let codec = ProtocolCodec::new();
        match codec.parse(r#"{"id":1,"result":{"name":"A"}}"#).unwrap() {
            Inbound::Response { id, result } => {
                assert_eq!(id, 1);
                assert_eq!(result.unwrap(), json!({"name": "A"}));
            }
            _ => panic!("expected response"),
        }

        match codec
            .parse(r#"{"id":2,"error":{"code":404,"message":"not found"}}"#)
            .unwrap()
        {
            Inbound::Response { id, result } => {
                assert_eq!(id, 2);
                let (code, message, data) = result.unwrap_err();
                assert_eq!(code, 404);
                assert_eq!(message, "not found");
                assert_eq!(data, None);
            }
            _ => panic!("expected response"),
        }

        match codec
            .parse(r#"{"event":"user.42.change","data":{"name":"B"}}"#)
            .unwrap()
        {
            Inbound::Event { rid, name, data } => {
                assert_eq!(rid, "user.42");
                assert_eq!(name, "change");
                assert_eq!(data, json!({"name": "B"}));
            }
            _ => panic!("expected event"),
        }

        assert!(codec.parse(r#"{"event":"noevent"}"#).is_err());
        assert!(codec.parse(r#"{"foo":"bar"}"#).is_err());
        assert!(codec.parse("not json").is_err());
    }

    #[tokio::test]
    async fn prepare_and_complete_round_trip_resolves_receiver() {
        let codec = ProtocolCodec::new();
        let (id, text, rx) = codec.prepare_request("call.user.42.greet", Some(json!({"n": 1})));
        assert!(text.contains("\"id\":1"));
        let resource_err = codec.complete(id, Ok(json!({"ok": true}))).unwrap();
        assert!(resource_err.is_none());
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn complete_with_error_builds_resource_error_and_resolves_err() {
        let codec = ProtocolCodec::new();
        let (id, _, rx) = codec.prepare_request("call.user.42.greet", None);
        let resource_err = codec
            .complete(id, Err((1, "bad".to_string(), None)))
            .unwrap()
            .unwrap();
        assert_eq!(resource_err.method, "call.user.42.greet");
        assert!(matches!(rx.await.unwrap(), Err(Error::Resource(_))));
    }

    #[test]
    fn complete_unknown_id_is_a_protocol_error() {
        let codec = ProtocolCodec::new();
        assert!(matches!(
            codec.complete(999, Ok(Value::Null)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_set_params_translates_none_to_delete_sentinel() {
        let mut props = HashMap::new();
        props.insert("a".to_string(), None);
        props.insert("b".to_string(), Some(json!(2)));
        let encoded = encode_set_params(props);
        assert_eq!(encoded["a"], json!({"action": "delete"}));
        assert_eq!(encoded["b"], json!(2));
    }
}
