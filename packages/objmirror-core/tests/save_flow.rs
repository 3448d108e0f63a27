use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::{block_on, LocalPool};
use futures::task::LocalSpawnExt;
use serde_json::json;

use objmirror_core::{
    Error, FetchOptions, Method, Object, RequestOptions, RestResponse, Result, SaveOptions, Value,
};
use objmirror_test_support::{client_with, MockRestController, Strategy};

const CREATED_AT: &str = "2024-05-01T10:00:00.000Z";

fn spawn_save(pool: &LocalPool, object: &Object) -> Rc<RefCell<Option<Result<Object>>>> {
    let slot = Rc::new(RefCell::new(None));
    let out = slot.clone();
    let save = object.save(SaveOptions::default());
    pool.spawner()
        .spawn_local(async move {
            *out.borrow_mut() = Some(save.await);
        })
        .unwrap();
    slot
}

#[test]
fn edits_during_an_inflight_save_go_to_the_next_save() {
    let rest = MockRestController::new();
    let gate = rest.reply_gated();
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let post = client.create("Post");
    post.set("foo", "bar").unwrap();

    let mut pool = LocalPool::new();
    let first = spawn_save(&pool, &post);
    pool.run_until_stalled();
    assert_eq!(rest.request_count(), 1);
    let request = rest.last_request().unwrap();
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.path, "classes/Post");
    assert_eq!(request.body, Some(json!({"foo": "bar"})));

    post.set("foo", "baz").unwrap();
    assert_eq!(post.get("foo").unwrap(), Some(Value::from("baz")));

    gate.open(RestResponse::created(json!({"objectId": "p1", "createdAt": CREATED_AT})));
    pool.run_until_stalled();
    assert!(matches!(first.borrow().as_ref(), Some(Ok(_))));

    assert_eq!(post.id().as_deref(), Some("p1"));
    assert_eq!(post.server_data().unwrap()["foo"], Value::from("bar"));
    let attrs = post.attributes().unwrap();
    assert_eq!(attrs["foo"], Value::from("baz"));
    assert!(attrs.contains_key("createdAt"));
    assert!(attrs.contains_key("updatedAt"));
    assert!(post.dirty(Some("foo")).unwrap());

    rest.reply_ok(json!({"updatedAt": "2024-05-01T10:05:00.000Z"}));
    block_on(post.save(SaveOptions::default())).unwrap();
    let request = rest.last_request().unwrap();
    assert_eq!(request.method, Method::Put);
    assert_eq!(request.path, "classes/Post/p1");
    assert_eq!(request.body, Some(json!({"foo": "baz"})));
    assert!(!post.dirty(None).unwrap());
}

#[test]
fn saved_attributes_estimate_with_timestamps() {
    let rest = MockRestController::new();
    rest.reply_created(json!({"objectId": "p1", "createdAt": CREATED_AT}));
    let client = client_with(Strategy::SingleInstance, rest);
    let post = client.create("Post");
    post.set("foo", "bar").unwrap();
    block_on(post.save(SaveOptions::default())).unwrap();

    let attrs = post.attributes().unwrap();
    assert_eq!(attrs.len(), 3);
    assert_eq!(attrs["foo"], Value::from("bar"));
    assert_eq!(attrs["createdAt"], attrs["updatedAt"]);
    assert!(!post.existed().unwrap());
}

#[test]
fn failed_save_keeps_edits_for_the_retry() {
    for strategy in Strategy::ALL {
        let rest = MockRestController::new();
        rest.reply_error(141, "validation failed");
        rest.reply_ok(json!({"updatedAt": CREATED_AT}));
        let client = client_with(strategy, rest.clone());
        let post = client.create_without_data("Post", "p1");
        post.increment("views", 1).unwrap();

        let err = block_on(post.save(SaveOptions::default())).unwrap_err();
        assert!(matches!(err, Error::Server { code: 141, .. }));
        assert_eq!(post.get("views").unwrap(), Some(Value::from(1)));
        assert_eq!(post.pending_ops().unwrap().len(), 1);

        post.increment("views", 2).unwrap();
        block_on(post.save(SaveOptions::default())).unwrap();
        assert_eq!(
            rest.last_request().unwrap().body,
            Some(json!({"views": {"__op": "Increment", "amount": 3}}))
        );
        assert_eq!(post.server_data().unwrap()["views"], Value::from(3));
        assert!(post.existed().unwrap());
    }
}

#[test]
fn overlapping_saves_are_sent_one_at_a_time() {
    let rest = MockRestController::new();
    let gate = rest.reply_gated();
    rest.reply_ok(json!({}));
    let client = client_with(Strategy::UniqueInstance, rest.clone());
    let post = client.create_without_data("Post", "p1");

    let mut pool = LocalPool::new();
    post.set("a", 1).unwrap();
    let first = spawn_save(&pool, &post);
    post.set("b", 2).unwrap();
    let second = spawn_save(&pool, &post);

    pool.run_until_stalled();
    assert_eq!(rest.request_count(), 1);
    assert!(second.borrow().is_none());

    gate.open(RestResponse::ok(json!({})));
    pool.run_until_stalled();
    assert!(matches!(first.borrow().as_ref(), Some(Ok(_))));
    assert!(matches!(second.borrow().as_ref(), Some(Ok(_))));

    let requests = rest.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, Some(json!({"a": 1})));
    assert_eq!(requests[1].body, Some(json!({"b": 2})));
    let data = post.server_data().unwrap();
    assert_eq!(data["a"], Value::from(1));
    assert_eq!(data["b"], Value::from(2));
}

#[test]
fn dropped_save_leaves_its_edits_for_the_next_save() {
    let rest = MockRestController::new();
    rest.reply_ok(json!({}));
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let post = client.create_without_data("Post", "p1");

    post.set("a", 1).unwrap();
    drop(post.save(SaveOptions::default()));
    assert_eq!(post.pending_ops().unwrap().len(), 1);
    post.set("b", 2).unwrap();

    block_on(post.save(SaveOptions::default())).unwrap();
    assert_eq!(rest.request_count(), 1);
    assert_eq!(rest.last_request().unwrap().body, Some(json!({"a": 1, "b": 2})));
    assert_eq!(post.pending_ops().unwrap().len(), 1);
    assert!(!post.dirty(None).unwrap());
}

#[test]
fn dropped_save_behind_an_inflight_one_folds_into_the_next() {
    let rest = MockRestController::new();
    let gate = rest.reply_gated();
    rest.reply_ok(json!({}));
    let client = client_with(Strategy::UniqueInstance, rest.clone());
    let post = client.create_without_data("Post", "p1");

    let mut pool = LocalPool::new();
    post.set("a", 1).unwrap();
    let first = spawn_save(&pool, &post);
    pool.run_until_stalled();
    assert_eq!(rest.request_count(), 1);

    post.set("b", 2).unwrap();
    drop(post.save(SaveOptions::default()));
    post.set("c", 3).unwrap();
    assert_eq!(post.pending_ops().unwrap().len(), 2);

    gate.open(RestResponse::ok(json!({})));
    pool.run_until_stalled();
    assert!(matches!(first.borrow().as_ref(), Some(Ok(_))));
    assert_eq!(rest.request_count(), 1);
    assert_eq!(post.pending_ops().unwrap().len(), 1);

    block_on(post.save(SaveOptions::default())).unwrap();
    let requests = rest.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, Some(json!({"a": 1})));
    assert_eq!(requests[1].body, Some(json!({"b": 2, "c": 3})));
    assert!(!post.dirty(None).unwrap());
    assert_eq!(post.server_data().unwrap()["c"], Value::from(3));
}

#[test]
fn cascade_save_stores_unsaved_children_first() {
    let rest = MockRestController::new();
    rest.reply_ok(json!([{"success": {"objectId": "u1", "createdAt": CREATED_AT}}]));
    rest.reply_created(json!({"objectId": "p1", "createdAt": CREATED_AT}));
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let author = client.create("User");
    author.set("name", "ada").unwrap();
    let post = client.create("Post");
    post.set("author", &author).unwrap();

    block_on(post.save(SaveOptions::default())).unwrap();

    let requests = rest.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, "batch");
    assert_eq!(
        requests[0].body,
        Some(json!({"requests": [
            {"method": "POST", "path": "/parse/classes/User", "body": {"name": "ada"}}
        ]}))
    );
    assert_eq!(
        requests[1].body,
        Some(json!({"author": {"__type": "Pointer", "className": "User", "objectId": "u1"}}))
    );
    assert_eq!(author.id().as_deref(), Some("u1"));
    assert_eq!(post.id().as_deref(), Some("p1"));
}

#[test]
fn save_without_cascade_rejects_unsaved_pointer() {
    let rest = MockRestController::new();
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let post = client.create("Post");
    post.set("author", &client.create("User")).unwrap();

    let options = SaveOptions {
        cascade_save: false,
        ..SaveOptions::default()
    };
    let err = block_on(post.save(options)).unwrap_err();
    assert!(matches!(err, Error::UnsavedReference(_)));
    assert_eq!(rest.request_count(), 0);
    assert_eq!(post.pending_ops().unwrap().len(), 1);
    assert!(post.pending_ops().unwrap()[0].contains_key("author"));
}

#[test]
fn relation_changes_are_sent_and_committed() {
    let rest = MockRestController::new();
    rest.reply_ok(json!({"updatedAt": CREATED_AT}));
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let post = client.create_without_data("Post", "p1");
    let tags = post.relation("tags").unwrap();
    tags.add(&[client.create_without_data("Tag", "t1")]).unwrap();

    block_on(post.save(SaveOptions::default())).unwrap();
    assert_eq!(
        rest.last_request().unwrap().body,
        Some(json!({"tags": {"__op": "AddRelation", "objects": [
            {"__type": "Pointer", "className": "Tag", "objectId": "t1"}
        ]}}))
    );
    let server = post.server_data().unwrap();
    let relation = server["tags"].as_relation().unwrap();
    assert_eq!(relation.target_class_name.as_deref(), Some("Tag"));
}

#[test]
fn fetch_replaces_server_data_and_drops_current_edits() {
    let rest = MockRestController::new();
    rest.reply_ok(json!({"objectId": "p1", "title": "remote", "createdAt": CREATED_AT}));
    let client = client_with(Strategy::SingleInstance, rest.clone());
    let post = client.create_without_data("Post", "p1");
    post.set("title", "local").unwrap();

    let options = FetchOptions {
        include: vec!["author".into()],
        ..FetchOptions::default()
    };
    block_on(post.fetch(options)).unwrap();

    let request = rest.last_request().unwrap();
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.path, "classes/Post/p1");
    assert_eq!(request.body, Some(json!({"include": "author"})));
    assert_eq!(post.get("title").unwrap(), Some(Value::from("remote")));
    assert!(!post.dirty(None).unwrap());
    assert!(post.existed().unwrap());
    assert_eq!(post.updated_at().unwrap(), post.created_at().unwrap());
}

#[test]
fn fetch_needs_an_id() {
    let client = client_with(Strategy::SingleInstance, MockRestController::new());
    let err = block_on(client.create("Post").fetch(FetchOptions::default())).unwrap_err();
    assert!(matches!(err, Error::MissingObjectId(_)));
}

#[test]
fn destroy_sends_delete_and_skips_unsaved_objects() {
    let rest = MockRestController::new();
    rest.reply_ok(json!({}));
    let client = client_with(Strategy::SingleInstance, rest.clone());

    block_on(client.create("Post").destroy(RequestOptions::default())).unwrap();
    assert_eq!(rest.request_count(), 0);

    let options = RequestOptions {
        session_token: Some("r:abc".into()),
        ..RequestOptions::default()
    };
    block_on(client.create_without_data("Post", "p1").destroy(options.clone())).unwrap();
    let request = rest.last_request().unwrap();
    assert_eq!(request.method, Method::Delete);
    assert_eq!(request.path, "classes/Post/p1");
    assert_eq!(request.options, options);
}

#[test]
fn custom_object_id_is_required_before_save() {
    let rest = MockRestController::new();
    let config = objmirror_core::ClientConfig {
        allow_custom_object_id: true,
        ..objmirror_core::ClientConfig::default()
    };
    let client = objmirror_core::Client::new(config, rest.clone());
    let err = block_on(client.create("Post").save(SaveOptions::default())).unwrap_err();
    assert!(matches!(err, Error::MissingObjectId(_)));
    assert_eq!(rest.request_count(), 0);
}
