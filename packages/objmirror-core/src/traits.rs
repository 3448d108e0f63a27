use std::rc::Rc;

use futures::future::{self, FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{codes, Error, Result};
use crate::object::Object;
use crate::ops::Op;
use crate::state::{self, AttributeChanges, ObjectCache, OpBatch, StateRef};
use crate::task_queue::TaskQueue;
use crate::value::{Attributes, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// Per-request credentials forwarded to the transport untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_master_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl RestResponse {
    pub fn ok(body: JsonValue) -> Self {
        Self { status: 200, body }
    }

    pub fn created(body: JsonValue) -> Self {
        Self { status: 201, body }
    }
}

/// Transport to the backend. Failures surface as [`Error::Server`] carrying the backend's
/// `{code, error}` payload.
pub trait RestController {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        options: &RequestOptions,
    ) -> LocalBoxFuture<'static, Result<RestResponse>>;
}

impl<T: RestController + ?Sized> RestController for Rc<T> {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        options: &RequestOptions,
    ) -> LocalBoxFuture<'static, Result<RestResponse>> {
        (**self).request(method, path, body, options)
    }
}

/// Transport for purely local use; every request fails as if the backend were unreachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRestController;

impl RestController for NoopRestController {
    fn request(
        &self,
        method: Method,
        path: &str,
        _body: Option<JsonValue>,
        _options: &RequestOptions,
    ) -> LocalBoxFuture<'static, Result<RestResponse>> {
        let message = format!("no transport configured for {} {path}", method.as_str());
        future::ready(Err(Error::server(codes::CONNECTION_FAILED, message))).boxed_local()
    }
}

/// Registry mapping object identities to their state records.
///
/// Implementors supply lookup and lifecycle; everything else is provided on top of the pure
/// functions in [`crate::state`] so both strategies behave the same.
pub trait StateStore {
    fn get_state(&self, object: &Object) -> Option<StateRef>;

    /// Existing state for `object`, or a fresh one. Passing `initial` replaces whatever is
    /// registered with that exact record.
    fn initialize_state(&self, object: &Object, initial: Option<StateRef>) -> StateRef;

    /// Detach and return the state for `object`, if any.
    fn remove_state(&self, object: &Object) -> Option<StateRef>;

    fn duplicate_state(&self, source: &Object, dest: &Object);

    fn clear_all_state(&self);

    fn get_server_data(&self, object: &Object) -> Attributes {
        self.get_state(object)
            .map(|state| state.borrow().server_data.clone())
            .unwrap_or_default()
    }

    fn set_server_data(&self, object: &Object, attributes: AttributeChanges) {
        let state = self.initialize_state(object, None);
        state::set_server_data(&mut state.borrow_mut().server_data, attributes);
    }

    fn get_pending_ops(&self, object: &Object) -> Vec<OpBatch> {
        self.get_state(object)
            .map(|state| state.borrow().pending_ops.clone())
            .unwrap_or_else(|| vec![OpBatch::new()])
    }

    fn set_pending_op(&self, object: &Object, attr: &str, op: Option<Op>) {
        let state = self.initialize_state(object, None);
        state::set_pending_op(&mut state.borrow_mut().pending_ops, attr, op);
    }

    fn push_pending_state(&self, object: &Object) {
        self.seal_pending_state(object);
    }

    /// Start a new batch for local edits and return the ticket of the batch just sealed.
    fn seal_pending_state(&self, object: &Object) -> u64 {
        let state = self.initialize_state(object, None);
        let mut state = state.borrow_mut();
        state::push_pending_state(&mut state.pending_ops);
        state.next_seal += 1;
        let ticket = state.next_seal;
        state.seals.push(ticket);
        ticket
    }

    fn pop_pending_state(&self, object: &Object) -> OpBatch {
        let state = self.initialize_state(object, None);
        let mut state = state.borrow_mut();
        let state = &mut *state;
        let batch = state::pop_pending_state(&mut state.pending_ops);
        state::retire_seals(&mut state.seals, state.pending_ops.len());
        batch
    }

    fn merge_first_pending_state(&self, object: &Object) -> Result<()> {
        let state = self.initialize_state(object, None);
        let mut state = state.borrow_mut();
        let state = &mut *state;
        state::merge_first_pending_state(&mut state.pending_ops)?;
        state::retire_seals(&mut state.seals, state.pending_ops.len());
        Ok(())
    }

    /// Fold the batch sealed under `ticket` into the batch after it. Returns `false` when a
    /// settled save already retired it. A batch that cannot be merged is dropped and the
    /// merge error returned.
    fn fold_sealed_batch(&self, object: &Object, ticket: u64) -> Result<bool> {
        let Some(state) = self.get_state(object) else {
            return Ok(false);
        };
        let mut state = state.borrow_mut();
        let state = &mut *state;
        let Some(index) = state.seals.iter().position(|seal| *seal == ticket) else {
            return Ok(false);
        };
        state.seals.remove(index);
        match state::merge_pending_state_at(&mut state.pending_ops, index) {
            Ok(()) => Ok(true),
            Err(err) => {
                state.pending_ops.remove(index);
                Err(err)
            }
        }
    }

    fn get_object_cache(&self, object: &Object) -> ObjectCache {
        self.get_state(object)
            .map(|state| state.borrow().object_cache.clone())
            .unwrap_or_default()
    }

    fn estimate_attribute(&self, object: &Object, attr: &str) -> Result<Option<Value>> {
        let Some(state) = self.get_state(object) else {
            return Ok(None);
        };
        let state = state.borrow();
        state::estimate_attribute(&state.server_data, &state.pending_ops, &object.parent_ref(), attr)
    }

    fn estimate_attributes(&self, object: &Object) -> Result<Attributes> {
        let Some(state) = self.get_state(object) else {
            return Ok(Attributes::new());
        };
        let state = state.borrow();
        state::estimate_attributes(&state.server_data, &state.pending_ops, &object.parent_ref())
    }

    fn commit_server_changes(&self, object: &Object, changes: AttributeChanges) {
        let state = self.initialize_state(object, None);
        let mut state = state.borrow_mut();
        let state = &mut *state;
        state::commit_server_changes(&mut state.server_data, &mut state.object_cache, changes);
    }

    fn existed(&self, object: &Object) -> bool {
        self.get_state(object)
            .map(|state| state.borrow().existed)
            .unwrap_or(false)
    }

    fn set_existed(&self, object: &Object, existed: bool) {
        let state = self.initialize_state(object, None);
        state.borrow_mut().existed = existed;
    }

    fn task_queue(&self, object: &Object) -> Rc<TaskQueue> {
        let state = self.initialize_state(object, None);
        let tasks = state.borrow().tasks.clone();
        tasks
    }

    fn enqueue_task(
        &self,
        object: &Object,
        task: LocalBoxFuture<'static, Result<()>>,
    ) -> LocalBoxFuture<'static, Result<()>> {
        self.task_queue(object).enqueue(move || task)
    }
}
