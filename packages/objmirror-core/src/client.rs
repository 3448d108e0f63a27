use std::cell::Cell;
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::controller::{self, SaveOptions};
use crate::error::{Error, Result};
use crate::object::Object;
use crate::store::{SingleInstanceStore, UniqueInstanceStore};
use crate::traits::{RequestOptions, RestController, StateStore};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:1337/parse";
pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Handles for the same `(class, id)` share one state record.
    pub single_instance: bool,
    /// Object ids are chosen by the caller and sent on create.
    pub allow_custom_object_id: bool,
    /// Maximum number of sub-requests per batch request.
    pub batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            single_instance: true,
            allow_custom_object_id: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `OBJMIRROR_*` environment variables. Unparsable values are
    /// logged and skipped.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OBJMIRROR_SERVER_URL") {
            config.server_url = url;
        }
        if let Some(flag) = env_parse::<bool>("OBJMIRROR_SINGLE_INSTANCE") {
            config.single_instance = flag;
        }
        if let Some(flag) = env_parse::<bool>("OBJMIRROR_ALLOW_CUSTOM_OBJECT_ID") {
            config.allow_custom_object_id = flag;
        }
        if let Some(size) = env_parse::<usize>("OBJMIRROR_BATCH_SIZE") {
            config.batch_size = size;
        }
        config
    }

    /// Mount path of the server url, with leading and trailing slashes: `/parse/`.
    pub fn server_path(&self) -> String {
        let without_scheme = match self.server_url.split_once("://") {
            Some((_, rest)) => rest,
            None => self.server_url.as_str(),
        };
        let path = without_scheme
            .find('/')
            .map(|idx| &without_scheme[idx..])
            .unwrap_or("/");
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    /// Batch size with a floor of one.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    rest: Rc<dyn RestController>,
    single: SingleInstanceStore,
    unique: UniqueInstanceStore,
    single_instance: Cell<bool>,
}

/// Entry point holding configuration, the transport and the active storage strategy.
/// Cloning is cheap and every clone refers to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, rest: impl RestController + 'static) -> Self {
        Self::with_rest(config, Rc::new(rest))
    }

    pub fn with_rest(config: ClientConfig, rest: Rc<dyn RestController>) -> Self {
        let single_instance = Cell::new(config.single_instance);
        Self {
            inner: Rc::new(ClientInner {
                config,
                rest,
                single: SingleInstanceStore::default(),
                unique: UniqueInstanceStore::default(),
                single_instance,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn rest(&self) -> Rc<dyn RestController> {
        self.inner.rest.clone()
    }

    /// The storage strategy new state is registered in.
    pub fn store(&self) -> &dyn StateStore {
        if self.inner.single_instance.get() {
            &self.inner.single
        } else {
            &self.inner.unique
        }
    }

    pub fn single_instance_store(&self) -> &SingleInstanceStore {
        &self.inner.single
    }

    pub fn is_single_instance(&self) -> bool {
        self.inner.single_instance.get()
    }

    /// Swap the active strategy. Existing records stay where they are.
    pub fn set_single_instance(&self, enabled: bool) {
        debug!("single instance mode {}", if enabled { "enabled" } else { "disabled" });
        self.inner.single_instance.set(enabled);
    }

    pub fn clear_all_state(&self) {
        self.store().clear_all_state();
    }

    /// A new, unsaved object.
    pub fn create(&self, class_name: impl Into<String>) -> Object {
        Object::new(self, class_name.into(), None)
    }

    /// A handle for an existing backend object; no data is loaded.
    pub fn create_without_data(&self, class_name: impl Into<String>, id: impl Into<String>) -> Object {
        Object::new(self, class_name.into(), Some(id.into()))
    }

    /// Build a handle from full object JSON. With `override_existing`, server data already
    /// known for that identity is discarded first.
    pub fn object_from_json(&self, json: &JsonValue, override_existing: bool) -> Result<Object> {
        let map = json
            .as_object()
            .ok_or_else(|| Error::InvalidJson("object JSON must be a map".to_string()))?;
        let class_name = map
            .get("className")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::InvalidJson("cannot create an object without a className".to_string()))?;
        let object = self.create(class_name);

        let mut attributes = serde_json::Map::new();
        for (key, value) in map {
            if key != "className" && key != "__type" && key != "_localId" {
                attributes.insert(key.clone(), value.clone());
            }
        }
        let object_id = attributes.get("objectId").and_then(JsonValue::as_str).map(str::to_string);
        if override_existing {
            if let Some(id) = &object_id {
                object.set_id(Some(id.clone()));
            }
            object.clear_server_data()?;
        }
        object.finish_fetch(&attributes)?;
        if object_id.is_some() {
            object.set_existed(true)?;
        }
        Ok(object)
    }

    /// Save `objects` and their unsaved children with batch requests.
    pub fn save_all(
        &self,
        objects: &[Object],
        options: SaveOptions,
    ) -> LocalBoxFuture<'static, Result<Vec<Object>>> {
        controller::save_all(self.clone(), objects.to_vec(), options)
    }

    pub fn destroy_all(
        &self,
        objects: &[Object],
        options: RequestOptions,
    ) -> LocalBoxFuture<'static, Result<Vec<Object>>> {
        controller::destroy_all(self.clone(), objects.to_vec(), options)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("single_instance", &self.inner.single_instance.get())
            .finish()
    }
}
