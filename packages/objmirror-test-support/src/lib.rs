//! Shared helpers for objmirror integration tests: a scripted REST transport, logger setup and
//! a conformance suite that every state storage strategy must pass.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Once;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use log::trace;
use serde_json::Value as JsonValue;

use objmirror_core::error::codes;
use objmirror_core::{
    Client, ClientConfig, Error, Method, RequestOptions, RestController, RestResponse, Result,
};

static INIT: Once = Once::new();

/// Route `log` output through `env_logger` once per test binary. Honors `RUST_LOG`.
pub fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<JsonValue>,
    pub options: RequestOptions,
}

enum Reply {
    Ready(Result<RestResponse>),
    Gated(oneshot::Receiver<Result<RestResponse>>),
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<Reply>,
    requests: Vec<RecordedRequest>,
}

/// Transport that answers requests with scripted replies, in order, and records every request.
/// Clones share the script and the log.
#[derive(Clone, Default)]
pub struct MockRestController {
    state: Rc<RefCell<MockState>>,
}

/// Holds back a scripted reply until the test releases it.
pub struct Gate {
    sender: oneshot::Sender<Result<RestResponse>>,
}

impl Gate {
    pub fn open(self, response: RestResponse) {
        let _ = self.sender.send(Ok(response));
    }

    pub fn fail(self, code: i64, message: &str) {
        let _ = self.sender.send(Err(Error::server(code, message)));
    }
}

impl MockRestController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, response: RestResponse) -> &Self {
        self.state
            .borrow_mut()
            .replies
            .push_back(Reply::Ready(Ok(response)));
        self
    }

    pub fn reply_ok(&self, body: JsonValue) -> &Self {
        self.reply(RestResponse::ok(body))
    }

    pub fn reply_created(&self, body: JsonValue) -> &Self {
        self.reply(RestResponse::created(body))
    }

    pub fn reply_error(&self, code: i64, message: &str) -> &Self {
        self.state
            .borrow_mut()
            .replies
            .push_back(Reply::Ready(Err(Error::server(code, message))));
        self
    }

    /// Script a reply that stays pending until the returned gate is opened.
    pub fn reply_gated(&self) -> Gate {
        let (sender, receiver) = oneshot::channel();
        self.state
            .borrow_mut()
            .replies
            .push_back(Reply::Gated(receiver));
        Gate { sender }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.borrow().requests.len()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.borrow().requests.last().cloned()
    }
}

impl RestController for MockRestController {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        options: &RequestOptions,
    ) -> LocalBoxFuture<'static, Result<RestResponse>> {
        trace!("mock transport: {} {path}", method.as_str());
        let mut state = self.state.borrow_mut();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            body,
            options: options.clone(),
        });
        match state.replies.pop_front() {
            Some(Reply::Ready(result)) => future::ready(result).boxed_local(),
            Some(Reply::Gated(receiver)) => receiver
                .map(|result| {
                    result.unwrap_or_else(|_| {
                        Err(Error::server(codes::CONNECTION_FAILED, "gate dropped"))
                    })
                })
                .boxed_local(),
            None => future::ready(Err(Error::server(
                codes::CONNECTION_FAILED,
                format!("no scripted reply for {} {path}", method.as_str()),
            )))
            .boxed_local(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    SingleInstance,
    UniqueInstance,
}

impl Strategy {
    pub const ALL: [Strategy; 2] = [Strategy::SingleInstance, Strategy::UniqueInstance];
}

/// Client on `strategy` talking to `rest`.
pub fn client_with(strategy: Strategy, rest: MockRestController) -> Client {
    init_logger();
    let config = ClientConfig {
        single_instance: strategy == Strategy::SingleInstance,
        ..ClientConfig::default()
    };
    Client::new(config, rest)
}

/// Behaviour both storage strategies must share. Each check builds its own client.
pub mod state_store_conformance {
    use super::*;
    use objmirror_core::{AttributeChanges, Number, Op, OpBatch, Value};

    pub fn run_all(strategy: Strategy) {
        initialize_is_idempotent(strategy);
        remove_without_state_is_noop(strategy);
        pending_ops_start_with_one_empty_batch(strategy);
        push_pop_merge_cycle(strategy);
        unsettled_seal_folds_into_next_batch(strategy);
        estimate_folds_server_data_through_batches(strategy);
        server_data_changes_and_cache(strategy);
        clear_all_state_forgets_everything(strategy);
        tasks_are_per_object(strategy);
    }

    fn client(strategy: Strategy) -> Client {
        client_with(strategy, MockRestController::new())
    }

    pub fn initialize_is_idempotent(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");
        let first = store.initialize_state(&post, None);
        let second = store.initialize_state(&post, None);
        assert!(Rc::ptr_eq(&first, &second));

        let replacement = objmirror_core::State::default().into_ref();
        let installed = store.initialize_state(&post, Some(replacement.clone()));
        assert!(Rc::ptr_eq(&installed, &replacement));
        let current = store.get_state(&post);
        assert!(current.is_some_and(|state| Rc::ptr_eq(&state, &replacement)));
    }

    pub fn remove_without_state_is_noop(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");
        assert!(store.remove_state(&post).is_none());
        store.initialize_state(&post, None);
        assert!(store.remove_state(&post).is_some());
        assert!(store.get_state(&post).is_none());
    }

    pub fn pending_ops_start_with_one_empty_batch(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create("Post");
        assert_eq!(store.get_pending_ops(&post), vec![OpBatch::new()]);
        store.initialize_state(&post, None);
        assert_eq!(store.get_pending_ops(&post), vec![OpBatch::new()]);
    }

    pub fn push_pop_merge_cycle(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");

        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(1))));
        store.push_pending_state(&post);
        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(2))));
        assert_eq!(store.get_pending_ops(&post).len(), 2);

        store.merge_first_pending_state(&post).unwrap();
        let pending = store.get_pending_ops(&post);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["x"], Op::Increment(Number::Int(3)));

        store.push_pending_state(&post);
        let popped = store.pop_pending_state(&post);
        assert!(popped.contains_key("x"));
        assert_eq!(store.get_pending_ops(&post), vec![OpBatch::new()]);

        store.set_pending_op(&post, "y", Some(Op::Unset));
        store.set_pending_op(&post, "y", None);
        assert!(store.get_pending_ops(&post)[0].is_empty());
    }

    pub fn unsettled_seal_folds_into_next_batch(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");

        store.set_pending_op(&post, "a", Some(Op::Set(Value::from(1))));
        let in_flight = store.seal_pending_state(&post);
        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(1))));
        let abandoned = store.seal_pending_state(&post);
        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(2))));
        assert_ne!(in_flight, abandoned);

        assert!(store.fold_sealed_batch(&post, abandoned).unwrap());
        let pending = store.get_pending_ops(&post);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0]["a"], Op::Set(Value::from(1)));
        assert_eq!(pending[1]["x"], Op::Increment(Number::Int(3)));
        assert!(!store.fold_sealed_batch(&post, abandoned).unwrap());

        store.pop_pending_state(&post);
        assert!(!store.fold_sealed_batch(&post, in_flight).unwrap());
        assert_eq!(store.get_pending_ops(&post).len(), 1);
    }

    pub fn estimate_folds_server_data_through_batches(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");
        store.set_server_data(
            &post,
            AttributeChanges::from([("x".to_string(), Some(Value::from(5)))]),
        );
        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(2))));
        store.push_pending_state(&post);
        store.set_pending_op(&post, "x", Some(Op::Increment(Number::Int(3))));
        assert_eq!(
            store.estimate_attribute(&post, "x").unwrap(),
            Some(Value::from(10))
        );
        assert_eq!(store.estimate_attributes(&post).unwrap()["x"], Value::from(10));
        assert_eq!(store.get_server_data(&post)["x"], Value::from(5));
    }

    pub fn server_data_changes_and_cache(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");
        store.commit_server_changes(
            &post,
            AttributeChanges::from([
                ("tags".to_string(), Some(Value::from(vec!["a"]))),
                ("title".to_string(), Some(Value::from("t"))),
            ]),
        );
        assert!(store.get_object_cache(&post).contains_key("tags"));
        assert!(!store.get_object_cache(&post).contains_key("title"));

        store.set_server_data(&post, AttributeChanges::from([("title".to_string(), None)]));
        let data = store.get_server_data(&post);
        assert!(!data.contains_key("title"));
        assert!(data.contains_key("tags"));
    }

    pub fn clear_all_state_forgets_everything(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let post = client.create_without_data("Post", "p1");
        store.set_pending_op(&post, "x", Some(Op::Unset));
        store.set_existed(&post, true);
        client.clear_all_state();
        assert!(client.store().get_state(&post).is_none());
        assert!(!client.store().existed(&post));
    }

    pub fn tasks_are_per_object(strategy: Strategy) {
        let client = client(strategy);
        let store = client.store();
        let a = client.create_without_data("Post", "a");
        let b = client.create_without_data("Post", "b");
        let queue_a = store.task_queue(&a);
        let queue_b = store.task_queue(&b);
        assert!(!Rc::ptr_eq(&queue_a, &queue_b));
        assert!(Rc::ptr_eq(&queue_a, &store.task_queue(&a)));

        let held = queue_a.enqueue(|| async { Ok(()) });
        assert_eq!(queue_a.len(), 1);
        assert!(queue_b.is_empty());
        drop(held);
        assert!(queue_a.is_empty());
    }
}
