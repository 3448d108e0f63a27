#![forbid(unsafe_code)]
//! Local mirror of records stored on a remote object-document backend.
//! Objects track server-confirmed attributes separately from pending local operations, so
//! edits can be made, merged and replayed across save cycles before the backend confirms them.
//! The transport is pluggable through [`RestController`]; nothing here performs I/O itself.

pub mod client;
pub mod codec;
pub mod controller;
pub mod error;
pub mod ids;
pub mod object;
pub mod ops;
pub mod relation;
pub mod state;
pub mod store;
pub mod task_queue;
pub mod traits;
pub mod value;

pub use client::{Client, ClientConfig};
pub use codec::{decode, encode, fingerprint, EncodeOptions};
pub use controller::{can_be_serialized, unsaved_children, FetchOptions, SaveOptions, SaveParams};
pub use error::{Error, ObjectFailure, Result};
pub use ids::{is_local_id, new_local_id, ObjectKey, ParentRef};
pub use object::Object;
pub use ops::{ApplyContext, Op, RelationOp};
pub use relation::Relation;
pub use state::{AttributeChanges, ObjectCache, OpBatch, State, StateRef};
pub use store::{SingleInstanceStore, UniqueInstanceStore};
pub use task_queue::TaskQueue;
pub use traits::{Method, NoopRestController, RequestOptions, RestController, RestResponse, StateStore};
pub use value::{Attributes, FileRef, GeoPoint, Number, RelationValue, Value};
