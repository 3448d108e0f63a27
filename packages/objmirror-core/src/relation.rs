use serde_json::{json, Value as JsonValue};

use crate::error::Result;
use crate::object::Object;
use crate::ops::{Op, RelationOp};
use crate::value::Value;

/// Handle for a relation attribute of `parent`. Membership changes are recorded as relation
/// operations on the parent and sent with its next save.
#[derive(Clone, Debug)]
pub struct Relation {
    parent: Object,
    key: String,
}

impl Relation {
    pub(crate) fn new(parent: Object, key: impl Into<String>) -> Self {
        Self {
            parent,
            key: key.into(),
        }
    }

    pub fn parent(&self) -> &Object {
        &self.parent
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Class of the related objects, once known from server data or a pending change.
    pub fn target_class_name(&self) -> Result<Option<String>> {
        if let Some(Value::Relation(relation)) = self.parent.get(&self.key)? {
            if relation.target_class_name.is_some() {
                return Ok(relation.target_class_name);
            }
        }
        Ok(match self.parent.op(&self.key)? {
            Some(Op::Relation(op)) => op.target_class_name().map(str::to_string),
            Some(Op::Set(Value::Relation(relation))) => relation.target_class_name,
            _ => None,
        })
    }

    pub fn add(&self, objects: &[Object]) -> Result<()> {
        let op = RelationOp::new(objects, &[])?;
        self.parent.set_op(&self.key, Op::Relation(op))
    }

    pub fn remove(&self, objects: &[Object]) -> Result<()> {
        let op = RelationOp::new(&[], objects)?;
        self.parent.set_op(&self.key, Op::Relation(op))
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(json!({"__type": "Relation", "className": self.target_class_name()?}))
    }
}
