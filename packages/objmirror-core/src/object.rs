//! Object handles: the mutation surface application code works with.
//!
//! An [`Object`] is a cheap, clonable handle. It carries identity (class, server id, local id)
//! and resolves its state through the client's active [`StateStore`]. Reads estimate the
//! current value from server data plus pending operations; writes only ever add pending
//! operations, and server data moves forward only when the backend confirms a save or fetch.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{self, FutureExt, LocalBoxFuture};
use log::{debug, trace, warn};
use serde_json::{json, Map, Value as JsonValue};

use crate::client::{Client, ClientInner};
use crate::codec::{decode, encode, encode_inner, fingerprint, parse_date, EncodeOptions};
use crate::controller::{self, FetchOptions, SaveOptions, SaveParams};
use crate::error::{Error, Result};
use crate::ids::{new_local_id, ObjectKey, ParentRef};
use crate::ops::{ApplyContext, Op};
use crate::relation::Relation;
use crate::state::{AttributeChanges, OpBatch, StateRef};
use crate::traits::{Method, RequestOptions, StateStore};
use crate::value::{Attributes, Number, RelationValue, Value};

const READ_ONLY_ATTRIBUTES: [&str; 2] = ["createdAt", "updatedAt"];

struct ObjectInner {
    client: Weak<ClientInner>,
    class_name: String,
    id: RefCell<Option<String>>,
    local_id: RefCell<Option<String>>,
    /// State owned by the handle under the unique-instance strategy.
    slot: RefCell<Option<(u64, StateRef)>>,
}

#[derive(Clone)]
pub struct Object {
    inner: Rc<ObjectInner>,
}

/// A pending change handed to the `set` pipeline.
enum Change {
    Value(Value),
    Op(Op),
}

impl Object {
    pub(crate) fn new(client: &Client, class_name: String, id: Option<String>) -> Self {
        Self {
            inner: Rc::new(ObjectInner {
                client: client.downgrade(),
                class_name,
                id: RefCell::new(id),
                local_id: RefCell::new(None),
                slot: RefCell::new(None),
            }),
        }
    }

    pub fn client(&self) -> Result<Client> {
        self.inner
            .client
            .upgrade()
            .map(Client::from_inner)
            .ok_or(Error::ClientDropped)
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    pub fn id(&self) -> Option<String> {
        self.inner.id.borrow().clone()
    }

    pub(crate) fn set_id(&self, id: Option<String>) {
        *self.inner.id.borrow_mut() = id;
    }

    /// Temporary id, if one has been handed out.
    pub fn local_id(&self) -> Option<String> {
        self.inner.local_id.borrow().clone()
    }

    /// Id used to key state: the server id once known, a generated local id before that.
    pub fn state_id(&self) -> String {
        if let Some(id) = self.id() {
            return id;
        }
        self.inner
            .local_id
            .borrow_mut()
            .get_or_insert_with(new_local_id)
            .clone()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.class_name(), self.state_id())
    }

    pub(crate) fn seen_entry(&self) -> String {
        format!("{}:{}", self.class_name(), self.state_id())
    }

    pub fn parent_ref(&self) -> ParentRef {
        ParentRef {
            class_name: self.class_name().to_string(),
            object_id: self.id(),
        }
    }

    pub(crate) fn state_slot(&self) -> &RefCell<Option<(u64, StateRef)>> {
        &self.inner.slot
    }

    /// Same handle, or the same `(class, id)` identity.
    pub fn same_identity(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
            || (self.class_name() == other.class_name() && self.state_id() == other.state_id())
    }

    /// Two handles for the same saved backend object.
    pub fn equals(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
            || (self.class_name() == other.class_name()
                && self.id().is_some()
                && self.id() == other.id())
    }

    fn with_store<R>(&self, f: impl FnOnce(&dyn StateStore) -> R) -> Result<R> {
        let client = self.client()?;
        Ok(f(client.store()))
    }

    pub fn server_data(&self) -> Result<Attributes> {
        self.with_store(|store| store.get_server_data(self))
    }

    pub fn pending_ops(&self) -> Result<Vec<OpBatch>> {
        self.with_store(|store| store.get_pending_ops(self))
    }

    /// Current estimated attributes.
    pub fn attributes(&self) -> Result<Attributes> {
        self.with_store(|store| store.estimate_attributes(self))?
    }

    pub fn get(&self, attr: &str) -> Result<Option<Value>> {
        Ok(self.attributes()?.remove(attr))
    }

    pub fn has(&self, attr: &str) -> Result<bool> {
        Ok(matches!(self.get(attr)?, Some(value) if !value.is_null()))
    }

    /// Most recent pending operation for `attr`.
    pub fn op(&self, attr: &str) -> Result<Option<Op>> {
        let pending = self.pending_ops()?;
        Ok(pending.iter().rev().find_map(|batch| batch.get(attr).cloned()))
    }

    pub fn created_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.server_data()?.get("createdAt").and_then(Value::as_date))
    }

    pub fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.server_data()?.get("updatedAt").and_then(Value::as_date))
    }

    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    /// Whether the backend knew this object before the current save cycle.
    pub fn existed(&self) -> Result<bool> {
        self.with_store(|store| store.existed(self))
    }

    pub(crate) fn set_existed(&self, existed: bool) -> Result<()> {
        self.with_store(|store| store.set_existed(self, existed))
    }

    /// Container attributes whose content no longer matches the last committed fingerprint.
    fn dirty_object_attributes(&self) -> Result<Attributes> {
        let client = self.client()?;
        let store = client.store();
        let attributes = store.estimate_attributes(self)?;
        let cache = store.get_object_cache(self);
        let mut dirty = Attributes::new();
        for (attr, value) in attributes {
            if !value.is_container() {
                continue;
            }
            let unchanged = matches!(
                (fingerprint(&value), cache.get(&attr)),
                (Ok(hash), Some(cached)) if hash == *cached
            );
            if !unchanged {
                dirty.insert(attr, value);
            }
        }
        Ok(dirty)
    }

    /// Unsaved objects are always dirty. With `attr`, only that attribute is checked.
    pub fn dirty(&self, attr: Option<&str>) -> Result<bool> {
        if self.id().is_none() {
            return Ok(true);
        }
        let pending = self.pending_ops()?;
        let dirty_objects = self.dirty_object_attributes()?;
        Ok(match attr {
            Some(attr) => {
                dirty_objects.contains_key(attr) || pending.iter().any(|batch| batch.contains_key(attr))
            }
            None => !dirty_objects.is_empty() || pending.iter().any(|batch| !batch.is_empty()),
        })
    }

    pub fn dirty_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for batch in self.pending_ops()? {
            keys.extend(batch.into_keys());
        }
        keys.extend(self.dirty_object_attributes()?.into_keys());
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.apply_changes(vec![(key.to_string(), Change::Value(value.into()))])
    }

    /// Set several attributes at once. Nothing is recorded unless every change is valid.
    pub fn set_all(&self, attributes: Attributes) -> Result<()> {
        self.apply_changes(
            attributes
                .into_iter()
                .map(|(key, value)| (key, Change::Value(value)))
                .collect(),
        )
    }

    pub fn set_op(&self, key: &str, op: Op) -> Result<()> {
        self.apply_changes(vec![(key.to_string(), Change::Op(op))])
    }

    pub fn unset(&self, key: &str) -> Result<()> {
        self.set_op(key, Op::Unset)
    }

    pub fn increment(&self, key: &str, amount: impl Into<Number>) -> Result<()> {
        self.set_op(key, Op::Increment(amount.into()))
    }

    pub fn decrement(&self, key: &str, amount: impl Into<Number>) -> Result<()> {
        self.set_op(key, Op::Increment(amount.into().negate()))
    }

    pub fn add(&self, key: &str, item: impl Into<Value>) -> Result<()> {
        self.add_all(key, vec![item.into()])
    }

    pub fn add_all(&self, key: &str, items: Vec<Value>) -> Result<()> {
        self.set_op(key, Op::Add(items))
    }

    pub fn add_unique(&self, key: &str, item: impl Into<Value>) -> Result<()> {
        self.add_all_unique(key, vec![item.into()])
    }

    pub fn add_all_unique(&self, key: &str, items: Vec<Value>) -> Result<()> {
        self.set_op(key, Op::add_unique(items))
    }

    pub fn remove(&self, key: &str, item: impl Into<Value>) -> Result<()> {
        self.remove_all(key, vec![item.into()])
    }

    pub fn remove_all(&self, key: &str, items: Vec<Value>) -> Result<()> {
        self.set_op(key, Op::remove(items))
    }

    /// Relation helper for `key`. Fails when the attribute holds something other than a
    /// relation.
    pub fn relation(&self, key: &str) -> Result<Relation> {
        match self.get(key)? {
            None | Some(Value::Null) | Some(Value::Relation(_)) => Ok(Relation::new(self.clone(), key)),
            Some(other) => Err(Error::TypeMismatch(format!(
                "called relation() on non-relation field {key} ({})",
                other.type_name()
            ))),
        }
    }

    fn apply_changes(&self, changes: Vec<(String, Change)>) -> Result<()> {
        let client = self.client()?;
        let store = client.store();
        let server_data = store.get_server_data(self);

        let mut new_ops: Vec<(String, Op)> = Vec::with_capacity(changes.len());
        for (key, change) in changes {
            if READ_ONLY_ATTRIBUTES.contains(&key.as_str()) {
                continue;
            }
            if let Some((top, _)) = key.split_once('.') {
                // Nested fields can only be set inside an attribute the backend already has.
                if matches!(server_data.get(top), None | Some(Value::Null)) {
                    continue;
                }
            }
            let op = match change {
                Change::Op(op) => op,
                Change::Value(value) if key == "objectId" || key == "id" => {
                    if let Value::String(id) = value {
                        self.set_id(Some(id));
                    }
                    continue;
                }
                Change::Value(value) => self.op_for_value(&client, &key, value)?,
            };
            new_ops.push((key, op));
        }

        let current = store.estimate_attributes(self)?;
        let parent = self.parent_ref();
        for (key, op) in &new_ops {
            validate_key(key)?;
            if matches!(op, Op::Unset) {
                continue;
            }
            let ctx = ApplyContext { parent: &parent, key };
            let next = op.apply_to(current.get(key), Some(ctx))?;
            if key == "ACL" {
                validate_acl(next.as_ref())?;
            }
        }

        let pending = store.get_pending_ops(self);
        let latest = pending.last();
        let mut merged = Vec::with_capacity(new_ops.len());
        for (key, op) in new_ops {
            let previous = latest.and_then(|batch| batch.get(&key));
            merged.push((key, op.merge_with(previous)?));
        }
        for (key, op) in merged {
            store.set_pending_op(self, &key, Some(op));
        }
        Ok(())
    }

    fn op_for_value(&self, client: &Client, key: &str, value: Value) -> Result<Op> {
        match value {
            Value::Object(ref map) if matches!(map.get("__op"), Some(Value::String(_))) => {
                let json = encode(&value, EncodeOptions::pointers())?;
                Ok(Op::from_json(&json, client)?.unwrap_or(Op::Set(value)))
            }
            Value::Relation(relation) => Ok(Op::Set(Value::Relation(RelationValue::new(
                self.parent_ref(),
                key,
                relation.target_class_name,
            )))),
            other => Ok(Op::Set(other)),
        }
    }

    /// Drop pending changes to `keys` (or every key) from the current batch.
    pub fn revert(&self, keys: &[&str]) -> Result<()> {
        self.clear_pending_ops(if keys.is_empty() { None } else { Some(keys) })
    }

    /// Unset every attribute except the read-only timestamps.
    pub fn clear(&self) -> Result<()> {
        let keys: Vec<String> = self
            .attributes()?
            .into_keys()
            .filter(|key| !READ_ONLY_ATTRIBUTES.contains(&key.as_str()))
            .collect();
        self.apply_changes(keys.into_iter().map(|key| (key, Change::Op(Op::Unset))).collect())
    }

    /// Write `f`'s edit straight into server data without recording an operation. Such edits
    /// show up through container fingerprints in [`Object::dirty`].
    pub fn update_in_place(&self, key: &str, f: impl FnOnce(&mut Value)) -> Result<bool> {
        let client = self.client()?;
        let state = client.store().initialize_state(self, None);
        let current = state.borrow().server_data.get(key).cloned();
        let Some(mut value) = current else {
            return Ok(false);
        };
        f(&mut value);
        state.borrow_mut().server_data.insert(key.to_string(), value);
        Ok(true)
    }

    pub fn to_pointer(&self) -> Result<JsonValue> {
        let id = self.id().ok_or_else(|| {
            Error::UnsavedReference("cannot create a pointer to an unsaved object".to_string())
        })?;
        Ok(json!({"__type": "Pointer", "className": self.class_name(), "objectId": id}))
    }

    pub fn to_offline_pointer(&self) -> JsonValue {
        json!({"__type": "Object", "className": self.class_name(), "_localId": self.state_id()})
    }

    /// Attributes as wire JSON, with the oldest pending batch's operations in place of their
    /// values.
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(JsonValue::Object(self.to_json_map(None, false)?))
    }

    pub fn to_full_json(&self) -> Result<JsonValue> {
        self.to_full_json_inner(None, false)
    }

    pub(crate) fn to_full_json_inner(&self, seen: Option<&[String]>, offline: bool) -> Result<JsonValue> {
        let mut json = self.to_json_map(seen, offline)?;
        json.insert("__type".into(), JsonValue::from("Object"));
        json.insert("className".into(), JsonValue::from(self.class_name()));
        Ok(JsonValue::Object(json))
    }

    fn to_json_map(&self, seen: Option<&[String]>, offline: bool) -> Result<Map<String, JsonValue>> {
        let seen = match seen {
            Some(seen) => seen.to_vec(),
            None => vec![self.seen_entry()],
        };
        let options = EncodeOptions {
            force_pointers: false,
            offline,
        };
        let mut json = Map::new();
        for (attr, value) in self.attributes()? {
            let encoded = match (attr.as_str(), &value) {
                ("createdAt" | "updatedAt", Value::Date(date)) => {
                    JsonValue::from(date.to_rfc3339_opts(SecondsFormat::Millis, true))
                }
                _ => encode_inner(&value, options, Some(&seen))?,
            };
            json.insert(attr, encoded);
        }
        if let Some(first) = self.pending_ops()?.first() {
            for (attr, op) in first {
                if !attr.contains('.') {
                    json.insert(attr.clone(), op.to_json(offline)?);
                }
            }
        }
        if let Some(id) = self.id() {
            json.insert("objectId".into(), JsonValue::from(id));
        }
        Ok(json)
    }

    /// Fresh handle for the same object; state is carried over by the active strategy.
    pub fn new_instance(&self) -> Result<Object> {
        let client = self.client()?;
        let clone = Object::new(&client, self.class_name().to_string(), self.id());
        client.store().duplicate_state(self, &clone);
        Ok(clone)
    }

    /// Body for a save request: dirty containers as plain sets, then the oldest batch.
    pub(crate) fn save_json(&self) -> Result<Map<String, JsonValue>> {
        let pending = self.pending_ops()?;
        let first = pending.first().cloned().unwrap_or_default();
        let mut json = Map::new();
        for (attr, value) in self.dirty_object_attributes()? {
            let has_op = pending.iter().any(|batch| batch.contains_key(&attr));
            let nested = first
                .keys()
                .any(|key| key.split_once('.').is_some_and(|(top, _)| top == attr));
            if has_op || nested {
                continue;
            }
            json.insert(attr, Op::Set(value).to_json(false)?);
        }
        for (attr, op) in &first {
            json.insert(attr.clone(), op.to_json(false)?);
        }
        Ok(json)
    }

    pub(crate) fn save_params(&self, client: &Client) -> Result<SaveParams> {
        let mut body = self.save_json()?;
        let mut method = if self.id().is_some() { Method::Put } else { Method::Post };
        let mut path = format!("classes/{}", self.class_name());
        if client.config().allow_custom_object_id {
            let id = self.id().ok_or_else(|| {
                Error::MissingObjectId("objectId must not be empty or null".to_string())
            })?;
            if self.created_at()?.is_none() {
                method = Method::Post;
                body.insert("objectId".into(), JsonValue::from(id));
            } else {
                method = Method::Put;
                path = format!("{path}/{id}");
            }
        } else if let Some(id) = self.id() {
            path = format!("{path}/{id}");
        } else if self.class_name() == "_User" {
            path = "users".to_string();
        }
        Ok(SaveParams {
            method,
            path,
            body: JsonValue::Object(body),
        })
    }

    /// Apply a successful save response: retire the oldest batch, adopt the server id and
    /// commit what the backend now holds.
    pub(crate) fn handle_save_response(&self, response: &JsonValue, status: u16) -> Result<()> {
        let client = self.client()?;
        let store = client.store();
        let empty = Map::new();
        let response = response.as_object().unwrap_or(&empty);
        let server_id = response.get("objectId").and_then(JsonValue::as_str);

        let server_data = store.get_server_data(self);
        let current = store.estimate_attributes(self)?;
        let pending = store.get_pending_ops(self);
        let first = pending.first().cloned().unwrap_or_default();
        let parent = ParentRef {
            class_name: self.class_name().to_string(),
            object_id: self.id().or_else(|| server_id.map(str::to_string)),
        };

        let mut changes = AttributeChanges::new();
        for (attr, op) in &first {
            if let Op::Relation(_) = op {
                let ctx = ApplyContext { parent: &parent, key: attr };
                changes.insert(attr.clone(), op.apply_to(server_data.get(attr), Some(ctx))?);
            } else if !response.contains_key(attr) {
                changes.insert(attr.clone(), op.apply(nested_value(&server_data, attr))?);
            }
        }
        for (attr, value) in response {
            match (attr.as_str(), value) {
                ("objectId", _) => {}
                ("createdAt" | "updatedAt", JsonValue::String(iso)) => {
                    changes.insert(attr.clone(), Some(Value::Date(parse_date(iso)?)));
                }
                _ if is_delete_op(value) => {
                    changes.insert(attr.clone(), None);
                }
                _ => {
                    let decoded = match (decode(value, &client)?, current.get(attr)) {
                        (Value::Object(partial), Some(Value::Object(existing))) => {
                            let mut merged = existing.clone();
                            merged.extend(partial);
                            Value::Object(merged)
                        }
                        (decoded, _) => decoded,
                    };
                    changes.insert(attr.clone(), Some(decoded));
                }
            }
        }
        if !changes.contains_key("updatedAt") {
            if let Some(created) = changes.get("createdAt").cloned() {
                changes.insert("updatedAt".into(), created);
            }
        }

        store.pop_pending_state(self);
        if let Some(server_id) = server_id {
            self.migrate_id(server_id)?;
        }
        if status != 201 {
            store.set_existed(self, true);
        }
        store.commit_server_changes(self, changes);
        Ok(())
    }

    /// Fold the failed batch back into pending state so the next save retries it.
    pub(crate) fn handle_save_error(&self) {
        let Ok(client) = self.client() else {
            return;
        };
        let store = client.store();
        match store.merge_first_pending_state(self) {
            Ok(()) => warn!("save of {} failed; pending changes kept for retry", self.seen_entry()),
            Err(err) => {
                warn!("save of {} failed and its changes cannot be merged: {err}", self.seen_entry());
                store.pop_pending_state(self);
            }
        }
    }

    /// Switch from the temporary local id to `server_id`, rekeying shared state.
    pub(crate) fn migrate_id(&self, server_id: &str) -> Result<()> {
        if self.id().is_some() {
            return Ok(());
        }
        let client = self.client()?;
        if client.is_single_instance() {
            let store = client.store();
            let previous = store.remove_state(self);
            self.set_id(Some(server_id.to_string()));
            self.inner.local_id.borrow_mut().take();
            if let Some(state) = previous {
                store.initialize_state(self, Some(state));
            }
        } else {
            self.set_id(Some(server_id.to_string()));
            self.inner.local_id.borrow_mut().take();
        }
        trace!("migrated {} to server id {server_id}", self.class_name());
        Ok(())
    }

    /// Commit fetched server JSON as confirmed data.
    pub(crate) fn finish_fetch(&self, data: &Map<String, JsonValue>) -> Result<()> {
        let client = self.client()?;
        if self.id().is_none() {
            if let Some(id) = data.get("objectId").and_then(JsonValue::as_str) {
                self.set_id(Some(id.to_string()));
            }
        }
        let store = client.store();
        store.initialize_state(self, None);

        let mut changes = AttributeChanges::new();
        for (attr, value) in data {
            let decoded = match (attr.as_str(), value) {
                ("objectId", _) => continue,
                ("createdAt" | "updatedAt", JsonValue::String(iso)) => Value::Date(parse_date(iso)?),
                _ => decode(value, &client)?,
            };
            changes.insert(attr.clone(), Some(decoded));
        }
        if !changes.contains_key("updatedAt") {
            if let Some(created) = changes.get("createdAt").cloned() {
                changes.insert("updatedAt".into(), created);
            }
        }
        store.commit_server_changes(self, changes);
        Ok(())
    }

    pub(crate) fn clear_server_data(&self) -> Result<()> {
        let client = self.client()?;
        let store = client.store();
        let keys = store.get_server_data(self).into_keys().map(|key| (key, None)).collect();
        store.set_server_data(self, keys);
        Ok(())
    }

    /// Drop `keys` (or everything) from the current batch. Batches already in flight are left
    /// alone.
    pub(crate) fn clear_pending_ops(&self, keys: Option<&[&str]>) -> Result<()> {
        let client = self.client()?;
        let store = client.store();
        let keys: Vec<String> = match keys {
            Some(keys) => keys.iter().map(|key| key.to_string()).collect(),
            None => store
                .get_pending_ops(self)
                .last()
                .map(|batch| batch.keys().cloned().collect())
                .unwrap_or_default(),
        };
        for key in keys {
            store.set_pending_op(self, &key, None);
        }
        Ok(())
    }

    /// Save this object, first saving any unsaved objects it references.
    ///
    /// The current batch is sealed when `save` is called: edits made while the request is in
    /// flight go into the next batch and are sent by the next save.
    pub fn save(&self, options: SaveOptions) -> LocalBoxFuture<'static, Result<Object>> {
        match self.begin_save(options) {
            Ok(task) => task,
            Err(err) => future::ready(Err(err)).boxed_local(),
        }
    }

    /// Set `attributes` and save them in one step.
    pub fn save_attributes(
        &self,
        attributes: Attributes,
        options: SaveOptions,
    ) -> LocalBoxFuture<'static, Result<Object>> {
        match self.set_all(attributes) {
            Ok(()) => self.save(options),
            Err(err) => future::ready(Err(err)).boxed_local(),
        }
    }

    fn begin_save(&self, options: SaveOptions) -> Result<LocalBoxFuture<'static, Result<Object>>> {
        let client = self.client()?;
        let children = if options.cascade_save {
            controller::unsaved_children(self, false)?
        } else {
            Vec::new()
        };
        if client.config().allow_custom_object_id && self.id().is_none() {
            return Err(Error::MissingObjectId("objectId must not be empty or null".to_string()));
        }
        self.state_id();

        let sealed = SealedBatch::seal(&client, self);
        let queue = client.store().task_queue(self);
        let object = self.clone();
        let task = queue.enqueue(move || async move {
            object.run_save(&client, children, &options).await?;
            Ok(object)
        });
        Ok(async move {
            let _sealed = sealed;
            task.await
        }
        .boxed_local())
    }

    async fn run_save(&self, client: &Client, children: Vec<Object>, options: &SaveOptions) -> Result<()> {
        if !children.is_empty() {
            debug!("saving {} unsaved children of {}", children.len(), self.seen_entry());
            if let Err(err) = controller::save_batch(client.clone(), children, options.clone()).await {
                self.handle_save_error();
                return Err(err);
            }
        }
        let params = match self.save_params(client) {
            Ok(params) => params,
            Err(err) => {
                self.handle_save_error();
                return Err(err);
            }
        };
        debug!("saving {} with {} {}", self.seen_entry(), params.method.as_str(), params.path);
        let response = client
            .rest()
            .request(params.method, &params.path, Some(params.body), &options.request)
            .await;
        match response {
            Ok(response) => self.handle_save_response(&response.body, response.status),
            Err(err) => {
                self.handle_save_error();
                Err(err)
            }
        }
    }

    /// Reload server data, discarding the current batch of local edits.
    pub fn fetch(&self, options: FetchOptions) -> LocalBoxFuture<'static, Result<Object>> {
        let object = self.clone();
        async move {
            let client = object.client()?;
            let id = object
                .id()
                .ok_or_else(|| Error::MissingObjectId("object does not have an id".to_string()))?;
            let mut body = Map::new();
            if !options.include.is_empty() {
                body.insert("include".into(), JsonValue::from(options.include.join(",")));
            }
            if !options.keys.is_empty() {
                body.insert("keys".into(), JsonValue::from(options.keys.join(",")));
            }
            let path = format!("classes/{}/{id}", object.class_name());
            debug!("fetching {}", object.seen_entry());
            let response = client
                .rest()
                .request(Method::Get, &path, Some(JsonValue::Object(body)), &options.request)
                .await?;
            let data = response
                .body
                .as_object()
                .ok_or_else(|| Error::InvalidJson("fetch response must be an object".to_string()))?;
            object.clear_pending_ops(None)?;
            object.clear_server_data()?;
            object.finish_fetch(data)?;
            object.set_existed(true)?;
            Ok(object)
        }
        .boxed_local()
    }

    /// Delete the object on the backend. Objects without an id resolve immediately.
    pub fn destroy(&self, options: RequestOptions) -> LocalBoxFuture<'static, Result<Object>> {
        let Some(id) = self.id() else {
            return future::ready(Ok(self.clone())).boxed_local();
        };
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => return future::ready(Err(err)).boxed_local(),
        };
        let queue = client.store().task_queue(self);
        let object = self.clone();
        queue.enqueue(move || async move {
            let path = format!("classes/{}/{id}", object.class_name());
            debug!("destroying {}", object.seen_entry());
            client
                .rest()
                .request(Method::Delete, &path, Some(json!({})), &options)
                .await?;
            Ok(object)
        })
    }
}

/// A batch sealed for a save that has not settled yet. Dropping it before the save's response
/// or error was handled folds the batch into the next one, so its edits go out with the next
/// save instead of being stranded at the bottom of the pending stack.
pub(crate) struct SealedBatch {
    object: Object,
    ticket: u64,
}

impl SealedBatch {
    pub(crate) fn seal(client: &Client, object: &Object) -> Self {
        let ticket = client.store().seal_pending_state(object);
        Self {
            object: object.clone(),
            ticket,
        }
    }
}

impl Drop for SealedBatch {
    fn drop(&mut self) {
        let Ok(client) = self.object.client() else {
            return;
        };
        match client.store().fold_sealed_batch(&self.object, self.ticket) {
            Ok(true) => debug!(
                "unfinished save of {} folded back into pending changes",
                self.object.seen_entry()
            ),
            Ok(false) => {}
            Err(err) => warn!(
                "unfinished save of {} could not be folded back: {err}",
                self.object.seen_entry()
            ),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class_name", &self.inner.class_name)
            .field("id", &*self.inner.id.borrow())
            .field("local_id", &*self.inner.local_id.borrow())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// An ACL maps user ids, role names or `*` to `{read?: bool, write?: bool}`.
fn validate_acl(acl: Option<&Value>) -> Result<()> {
    let Some(Value::Object(entries)) = acl else {
        return Err(Error::InvalidAcl("ACL must be an object".to_string()));
    };
    for (principal, permissions) in entries {
        let Value::Object(permissions) = permissions else {
            return Err(Error::InvalidAcl(format!("permissions for {principal} must be an object")));
        };
        for (name, allowed) in permissions {
            if !matches!(name.as_str(), "read" | "write") || !matches!(allowed, Value::Bool(_)) {
                return Err(Error::InvalidAcl(format!(
                    "invalid permission {name:?} for {principal}"
                )));
            }
        }
    }
    Ok(())
}

fn is_delete_op(value: &JsonValue) -> bool {
    value.get("__op").and_then(JsonValue::as_str) == Some("Delete")
}

fn nested_value<'a>(data: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut fields = path.split('.');
    let mut value = data.get(fields.next()?)?;
    for field in fields {
        value = value.as_object()?.get(field)?;
    }
    Some(value)
}
