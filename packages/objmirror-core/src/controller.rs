//! Save orchestration across objects: cascade discovery and the batch API.

use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::client::Client;
use crate::error::{codes, Error, ObjectFailure, Result};
use crate::object::{Object, SealedBatch};
use crate::traits::{Method, RequestOptions};
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveOptions {
    #[serde(flatten)]
    pub request: RequestOptions,
    /// Save unsaved referenced objects first.
    pub cascade_save: bool,
    /// Overrides the client's batch size.
    pub batch_size: Option<usize>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            request: RequestOptions::default(),
            cascade_save: true,
            batch_size: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    #[serde(flatten)]
    pub request: RequestOptions,
    /// Pointer fields to expand in the response.
    pub include: Vec<String>,
    /// Restrict the response to these fields.
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SaveParams {
    pub method: Method,
    pub path: String,
    pub body: JsonValue,
}

/// Objects reachable from `object` that must be saved before it. Deeper unsaved objects are
/// an error unless `allow_deep_unsaved`.
pub fn unsaved_children(object: &Object, allow_deep_unsaved: bool) -> Result<Vec<Object>> {
    let root = object.seen_entry();
    let mut encountered: Vec<(String, Option<Object>)> = Vec::new();
    encountered.push((root.clone(), object.dirty(None)?.then(|| object.clone())));
    for value in object.attributes()?.values() {
        traverse(value, &mut encountered, false, allow_deep_unsaved)?;
    }
    Ok(encountered
        .into_iter()
        .filter(|(key, _)| *key != root)
        .filter_map(|(_, object)| object)
        .collect())
}

fn traverse(
    value: &Value,
    encountered: &mut Vec<(String, Option<Object>)>,
    should_throw: bool,
    allow_deep_unsaved: bool,
) -> Result<()> {
    match value {
        Value::Pointer(object) => {
            if should_throw && object.id().is_none() {
                return Err(Error::UnsavedReference(
                    "cannot create a pointer to an unsaved object".to_string(),
                ));
            }
            let key = object.seen_entry();
            if encountered.iter().any(|(seen, _)| *seen == key) {
                return Ok(());
            }
            encountered.push((key, object.dirty(None)?.then(|| object.clone())));
            for value in object.attributes()?.values() {
                traverse(value, encountered, !allow_deep_unsaved, allow_deep_unsaved)?;
            }
            Ok(())
        }
        Value::File(file) if file.url.is_none() => Err(Error::UnsavedReference(format!(
            "file {} must be uploaded before saving an object that references it",
            file.name
        ))),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| traverse(item, encountered, should_throw, allow_deep_unsaved)),
        Value::Object(map) => map
            .values()
            .try_for_each(|item| traverse(item, encountered, should_throw, allow_deep_unsaved)),
        _ => Ok(()),
    }
}

/// True once every object `object` references has a server id.
pub fn can_be_serialized(object: &Object) -> Result<bool> {
    Ok(object.attributes()?.values().all(value_can_be_serialized))
}

fn value_can_be_serialized(value: &Value) -> bool {
    match value {
        Value::Pointer(object) => object.id().is_some(),
        Value::File(file) => file.url.is_some(),
        Value::Array(items) => items.iter().all(value_can_be_serialized),
        Value::Object(map) => map.values().all(value_can_be_serialized),
        _ => true,
    }
}

pub(crate) fn save_all(
    client: Client,
    objects: Vec<Object>,
    options: SaveOptions,
) -> LocalBoxFuture<'static, Result<Vec<Object>>> {
    async move {
        if objects.is_empty() {
            return Ok(objects);
        }
        let mut to_save = objects.clone();
        for object in &objects {
            to_save.extend(unsaved_children(object, true)?);
        }
        save_batch(client, to_save, options).await?;
        Ok(objects)
    }
    .boxed_local()
}

/// Save `objects` in rounds of batch requests. Each round takes the objects whose references
/// are all saved; a round with nothing to send is a cycle. Per-object failures are collected
/// and do not stop later rounds.
pub(crate) async fn save_batch(client: Client, objects: Vec<Object>, options: SaveOptions) -> Result<()> {
    let batch_size = options
        .batch_size
        .unwrap_or(client.config().batch_size)
        .max(1);
    let mut pending: Vec<Object> = Vec::with_capacity(objects.len());
    for object in objects {
        if !pending.iter().any(|seen| seen.same_identity(&object)) {
            pending.push(object);
        }
    }

    let mut failures = Vec::new();
    while !pending.is_empty() {
        let mut batch = Vec::new();
        let mut next = Vec::new();
        for object in pending {
            if client.config().allow_custom_object_id && object.id().is_none() {
                return Err(Error::MissingObjectId("objectId must not be empty or null".to_string()));
            }
            if batch.len() < batch_size && can_be_serialized(&object)? {
                batch.push(object);
            } else {
                next.push(object);
            }
        }
        pending = next;
        if batch.is_empty() {
            if failures.is_empty() {
                return Err(Error::Cycle);
            }
            break;
        }
        failures.extend(send_batch(&client, batch, &options).await);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(failures))
    }
}

type BatchReply = Rc<std::result::Result<Vec<JsonValue>, (i64, String)>>;

/// Outcome of one queued batch request.
struct BatchRun {
    /// The transport error, when the request itself failed.
    request_error: Option<Error>,
    /// Per-object results, in input order.
    outcomes: Vec<Result<()>>,
}

/// One batch request shared by `objects`. Every object queues a task on its own queue; the
/// request is built and sent once all of them are running, so earlier saves and destroys of
/// those objects have settled first. `settle` turns an object's reply entry into its outcome.
async fn queued_batch<B, S>(
    client: &Client,
    objects: &[Object],
    options: &RequestOptions,
    build: B,
    settle: S,
) -> BatchRun
where
    B: FnOnce(&[Object]) -> Result<Vec<JsonValue>> + 'static,
    S: Fn(usize, &Object, Result<JsonValue>) -> Result<()> + Clone + 'static,
{
    let store = client.store();
    let (reply_tx, reply_rx) = oneshot::channel::<BatchReply>();
    let reply: Shared<LocalBoxFuture<'static, BatchReply>> = reply_rx
        .map(|reply| {
            reply.unwrap_or_else(|_| {
                Rc::new(Err((codes::OTHER_CAUSE, "batch request was abandoned".to_string())))
            })
        })
        .boxed_local()
        .shared();

    let mut ready = Vec::with_capacity(objects.len());
    let mut tasks = Vec::with_capacity(objects.len());
    for (index, object) in objects.iter().enumerate() {
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        ready.push(ready_rx);
        let reply = reply.clone();
        let target = object.clone();
        let settle = settle.clone();
        tasks.push(store.task_queue(object).enqueue(move || async move {
            let _ = ready_tx.send(());
            let reply = reply.await;
            let entry = match reply.as_ref() {
                Ok(entries) => entries.get(index).map_or_else(
                    || Err(Error::InvalidJson("batch response is missing an entry".to_string())),
                    entry_outcome,
                ),
                Err((code, message)) => Err(Error::server(*code, message.clone())),
            };
            settle(index, &target, entry)
        }));
    }

    let rest = client.rest();
    let request_options = options.clone();
    let targets = objects.to_vec();
    let driver = async move {
        future::join_all(ready).await;
        let (reply, request_error) = match build(&targets) {
            Ok(requests) => {
                debug!("sending batch of {} requests", requests.len());
                let body = json!({"requests": requests});
                match rest.request(Method::Post, "batch", Some(body), &request_options).await {
                    Ok(response) => match response.body {
                        JsonValue::Array(entries) => (Ok(entries), None),
                        _ => (
                            Err((codes::INVALID_JSON, "batch response must be an array".to_string())),
                            None,
                        ),
                    },
                    Err(err) => (Err(split_error(&err)), Some(err)),
                }
            }
            Err(err) => (Err(split_error(&err)), None),
        };
        let _ = reply_tx.send(Rc::new(reply));
        request_error
    };

    let (request_error, outcomes) = future::join(driver, future::join_all(tasks)).await;
    BatchRun {
        request_error,
        outcomes,
    }
}

/// Save one batch of objects. Each object's current batch is sealed up front and its oldest
/// pending batch is the one sent.
async fn send_batch(client: &Client, batch: Vec<Object>, options: &SaveOptions) -> Vec<ObjectFailure> {
    let statuses: Rc<Vec<u16>> = Rc::new(
        batch
            .iter()
            .map(|object| if object.id().is_some() { 200 } else { 201 })
            .collect(),
    );
    let _sealed: Vec<SealedBatch> = batch
        .iter()
        .map(|object| SealedBatch::seal(client, object))
        .collect();
    let server_path = client.config().server_path();
    let run = queued_batch(
        client,
        &batch,
        &options.request,
        move |objects| batch_requests(objects, &server_path),
        move |index, object, entry| match entry {
            Ok(success) => object.handle_save_response(&success, statuses[index]),
            Err(err) => {
                object.handle_save_error();
                Err(err)
            }
        },
    )
    .await;
    collect_failures(&batch, run.outcomes)
}

fn collect_failures(objects: &[Object], outcomes: Vec<Result<()>>) -> Vec<ObjectFailure> {
    objects
        .iter()
        .zip(outcomes)
        .filter_map(|(object, result)| {
            result.err().map(|error| ObjectFailure {
                class_name: object.class_name().to_string(),
                object_id: object.id(),
                error,
            })
        })
        .collect()
}

fn batch_requests(objects: &[Object], server_path: &str) -> Result<Vec<JsonValue>> {
    objects
        .iter()
        .map(|object| {
            let client = object.client()?;
            let params = object.save_params(&client)?;
            Ok(json!({
                "method": params.method.as_str(),
                "path": format!("{server_path}{}", params.path),
                "body": params.body,
            }))
        })
        .collect()
}

fn destroy_requests(objects: &[Object], server_path: &str) -> Result<Vec<JsonValue>> {
    objects
        .iter()
        .map(|object| {
            let id = object
                .id()
                .ok_or_else(|| Error::MissingObjectId("object does not have an id".to_string()))?;
            Ok(json!({
                "method": "DELETE",
                "path": format!("{server_path}classes/{}/{id}", object.class_name()),
                "body": {},
            }))
        })
        .collect()
}

fn entry_outcome(entry: &JsonValue) -> Result<JsonValue> {
    if let Some(success) = entry.get("success") {
        Ok(success.clone())
    } else if let Some(error) = entry.get("error") {
        Err(Error::from_server_json(error))
    } else {
        Err(Error::InvalidJson("batch entry has neither success nor error".to_string()))
    }
}

fn split_error(err: &Error) -> (i64, String) {
    match err {
        Error::Server { code, message } => (*code, message.clone()),
        other => (other.code(), other.to_string()),
    }
}

/// Delete every saved object in `objects` through batch requests queued behind each object's
/// earlier saves and destroys. Objects without an id are skipped; per-object failures are
/// aggregated, and a failed request fails the whole call.
pub(crate) fn destroy_all(
    client: Client,
    objects: Vec<Object>,
    options: RequestOptions,
) -> LocalBoxFuture<'static, Result<Vec<Object>>> {
    async move {
        let batch_size = client.config().effective_batch_size();
        let mut targets: Vec<Object> = Vec::new();
        for object in objects.iter().filter(|object| object.id().is_some()) {
            if !targets.iter().any(|seen| seen.same_identity(object)) {
                targets.push(object.clone());
            }
        }

        let mut collected = Vec::new();
        for chunk in targets.chunks(batch_size) {
            let server_path = client.config().server_path();
            let run = queued_batch(
                &client,
                chunk,
                &options,
                move |objects| destroy_requests(objects, &server_path),
                |_, _, entry| entry.map(|_| ()),
            )
            .await;
            if let Some(err) = run.request_error {
                return Err(err);
            }
            collected.extend(collect_failures(chunk, run.outcomes));
        }

        if collected.is_empty() {
            Ok(objects)
        } else {
            Err(Error::Aggregate(collected))
        }
    }
    .boxed_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::traits::NoopRestController;

    fn client() -> Client {
        Client::new(ClientConfig::default(), NoopRestController)
    }

    #[test]
    fn unsaved_children_lists_dirty_references() {
        let client = client();
        let post = client.create("Post");
        let author = client.create("User");
        let saved_clean = client.create_without_data("Tag", "t1");
        post.set("author", &author).unwrap();
        post.set("tags", vec![Value::from(&saved_clean)]).unwrap();

        let children = unsaved_children(&post, false).unwrap();
        assert_eq!(children, vec![author]);
    }

    #[test]
    fn deep_unsaved_references_need_batch_save() {
        let client = client();
        let post = client.create("Post");
        let author = client.create("User");
        let avatar = client.create("Image");
        author.set("avatar", &avatar).unwrap();
        post.set("author", &author).unwrap();

        assert!(matches!(
            unsaved_children(&post, false),
            Err(Error::UnsavedReference(_))
        ));
        let children = unsaved_children(&post, true).unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn serializable_only_when_references_are_saved() {
        let client = client();
        let post = client.create("Post");
        let author = client.create("User");
        post.set("author", &author).unwrap();
        assert!(!can_be_serialized(&post).unwrap());
        author.set_id(Some("u1".into()));
        assert!(can_be_serialized(&post).unwrap());
    }

    #[test]
    fn save_options_default_to_cascading() {
        let options = SaveOptions::default();
        assert!(options.cascade_save);
        assert_eq!(options.batch_size, None);
    }
}
