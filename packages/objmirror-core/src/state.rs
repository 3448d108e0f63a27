//! Per-object state record and the pure functions that mutate it.
//!
//! Both storage strategies hold a [`State`] per object identity and route every change through
//! the functions in this module, so merge and estimate behaviour cannot drift between them.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::codec::fingerprint;
use crate::error::{Error, Result};
use crate::ids::ParentRef;
use crate::ops::{ApplyContext, Op};
use crate::task_queue::TaskQueue;
use crate::value::{Attributes, Value};

/// Operations pending for one save cycle, keyed by attribute.
pub type OpBatch = BTreeMap<String, Op>;

/// Fingerprints of the last committed container values, keyed by attribute.
pub type ObjectCache = HashMap<String, blake3::Hash>;

/// Confirmed changes to fold into server data. `None` removes the attribute.
pub type AttributeChanges = BTreeMap<String, Option<Value>>;

pub type StateRef = Rc<RefCell<State>>;

#[derive(Debug)]
pub struct State {
    pub server_data: Attributes,
    /// Oldest in-flight batch first; the last batch collects new local edits. Never empty.
    pub pending_ops: Vec<OpBatch>,
    pub object_cache: ObjectCache,
    pub existed: bool,
    pub tasks: Rc<TaskQueue>,
    /// One ticket per sealed batch, aligned with `pending_ops[..len - 1]`.
    pub seals: Vec<u64>,
    pub next_seal: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            server_data: Attributes::new(),
            pending_ops: vec![OpBatch::new()],
            object_cache: ObjectCache::new(),
            existed: false,
            tasks: Rc::new(TaskQueue::default()),
            seals: Vec::new(),
            next_seal: 0,
        }
    }
}

impl State {
    pub fn into_ref(self) -> StateRef {
        Rc::new(RefCell::new(self))
    }

    /// Copy of the data layers with a fresh task queue.
    pub fn deep_copy(&self) -> State {
        State {
            server_data: self.server_data.clone(),
            pending_ops: self.pending_ops.clone(),
            object_cache: self.object_cache.clone(),
            existed: self.existed,
            tasks: Rc::new(TaskQueue::default()),
            seals: self.seals.clone(),
            next_seal: self.next_seal,
        }
    }
}

pub fn set_server_data(server_data: &mut Attributes, attributes: AttributeChanges) {
    for (attr, value) in attributes {
        match value {
            Some(value) => {
                server_data.insert(attr, value);
            }
            None => {
                server_data.remove(&attr);
            }
        }
    }
}

/// Record `op` for `attr` in the newest batch, or drop the entry when `op` is `None`.
pub fn set_pending_op(pending_ops: &mut Vec<OpBatch>, attr: &str, op: Option<Op>) {
    if pending_ops.is_empty() {
        pending_ops.push(OpBatch::new());
    }
    let Some(last) = pending_ops.last_mut() else {
        return;
    };
    match op {
        Some(op) => {
            last.insert(attr.to_string(), op);
        }
        None => {
            last.remove(attr);
        }
    }
}

pub fn push_pending_state(pending_ops: &mut Vec<OpBatch>) {
    pending_ops.push(OpBatch::new());
}

pub fn pop_pending_state(pending_ops: &mut Vec<OpBatch>) -> OpBatch {
    let first = if pending_ops.is_empty() {
        OpBatch::new()
    } else {
        pending_ops.remove(0)
    };
    if pending_ops.is_empty() {
        pending_ops.push(OpBatch::new());
    }
    first
}

/// Fold the oldest batch back into the one after it so its edits ride along with the next
/// save. The merged batch is computed before anything is modified.
pub fn merge_first_pending_state(pending_ops: &mut Vec<OpBatch>) -> Result<()> {
    merge_pending_state_at(pending_ops, 0)
}

/// Fold the batch at `index` into the one after it. No-op when there is no later batch.
pub fn merge_pending_state_at(pending_ops: &mut Vec<OpBatch>, index: usize) -> Result<()> {
    if index + 1 >= pending_ops.len() {
        return Ok(());
    }
    let earlier = &pending_ops[index];
    let mut next = pending_ops[index + 1].clone();
    for (attr, op) in earlier {
        let merged = match next.get(attr) {
            Some(later) => later.merge_with(Some(op))?,
            None => op.clone(),
        };
        next.insert(attr.clone(), merged);
    }
    pending_ops.remove(index);
    pending_ops[index] = next;
    Ok(())
}

/// Drop the oldest tickets until every sealed batch left in `pending_len` has exactly one.
pub fn retire_seals(seals: &mut Vec<u64>, pending_len: usize) {
    let sealed = pending_len.saturating_sub(1);
    if seals.len() > sealed {
        let excess = seals.len() - sealed;
        seals.drain(..excess);
    }
}

/// Server value of `attr` folded through every pending batch, oldest first. Relation
/// operations only materialize once the parent has a server id.
pub fn estimate_attribute(
    server_data: &Attributes,
    pending_ops: &[OpBatch],
    parent: &ParentRef,
    attr: &str,
) -> Result<Option<Value>> {
    let mut value = server_data.get(attr).cloned();
    for batch in pending_ops {
        let Some(op) = batch.get(attr) else {
            continue;
        };
        value = match op {
            Op::Relation(_) if parent.object_id.is_none() => continue,
            Op::Relation(_) => op.apply_to(value.as_ref(), Some(ApplyContext { parent, key: attr }))?,
            _ => op.apply(value.as_ref())?,
        };
    }
    Ok(value)
}

pub fn estimate_attributes(
    server_data: &Attributes,
    pending_ops: &[OpBatch],
    parent: &ParentRef,
) -> Result<Attributes> {
    let mut data = server_data.clone();
    for batch in pending_ops {
        for (attr, op) in batch {
            match op {
                Op::Relation(_) => {
                    if parent.object_id.is_none() {
                        continue;
                    }
                    let ctx = ApplyContext { parent, key: attr };
                    let next = op.apply_to(data.get(attr), Some(ctx))?;
                    write_attribute(&mut data, attr, next);
                }
                _ if attr.contains('.') => apply_nested(&mut data, attr, |previous| op.apply(previous))?,
                _ => {
                    let next = op.apply(data.get(attr))?;
                    write_attribute(&mut data, attr, next);
                }
            }
        }
    }
    Ok(data)
}

/// Fold confirmed values into server data. Containers are fingerprinted so later in-place
/// edits show up as dirty; a container that cannot be encoded gets no cache entry.
pub fn commit_server_changes(
    server_data: &mut Attributes,
    object_cache: &mut ObjectCache,
    changes: AttributeChanges,
) {
    for (attr, value) in changes {
        let top = attr.split('.').next().unwrap_or(&attr).to_string();
        if attr.contains('.') {
            let result = apply_nested(server_data, &attr, |_| Ok(value.clone()));
            if result.is_err() {
                continue;
            }
        } else {
            write_attribute(server_data, &attr, value);
        }
        match server_data.get(&top) {
            Some(value) if value.is_container() => match fingerprint(value) {
                Ok(hash) => {
                    object_cache.insert(top, hash);
                }
                Err(_) => {
                    object_cache.remove(&top);
                }
            },
            _ => {
                object_cache.remove(&top);
            }
        }
    }
}

fn write_attribute(data: &mut Attributes, attr: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            data.insert(attr.to_string(), value);
        }
        None => {
            data.remove(attr);
        }
    }
}

/// Apply `f` to the value at a dotted path, creating intermediate maps as needed.
fn apply_nested<F>(data: &mut Attributes, path: &str, f: F) -> Result<()>
where
    F: FnOnce(Option<&Value>) -> Result<Option<Value>>,
{
    let mut fields: Vec<&str> = path.split('.').collect();
    let Some(last) = fields.pop() else {
        return Ok(());
    };
    let mut map = data;
    for field in fields {
        let entry = map
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Attributes::new()));
        map = match entry {
            Value::Object(inner) => inner,
            other => {
                return Err(Error::TypeMismatch(format!(
                    "cannot set nested field {path:?} through a {} value",
                    other.type_name()
                )))
            }
        };
    }
    let next = f(map.get(last))?;
    write_attribute(map, last, next);
    Ok(())
}
