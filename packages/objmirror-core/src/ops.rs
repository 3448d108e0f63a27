//! Atomic per-attribute operations.
//!
//! Each operation knows how to apply itself to a previous value, how to fold itself onto an
//! earlier pending operation for the same attribute, and how to travel over the wire.

use serde_json::{json, Map, Value as JsonValue};

use crate::client::Client;
use crate::codec::{decode, encode, EncodeOptions};
use crate::error::{Error, Result};
use crate::ids::ParentRef;
use crate::object::Object;
use crate::value::{Number, RelationValue, Value};

/// Object and attribute an operation is being applied for. Relation operations need it to
/// build a relation value from nothing.
#[derive(Clone, Copy, Debug)]
pub struct ApplyContext<'a> {
    pub parent: &'a ParentRef,
    pub key: &'a str,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Set(Value),
    Unset,
    Increment(Number),
    Add(Vec<Value>),
    AddUnique(Vec<Value>),
    Remove(Vec<Value>),
    Relation(RelationOp),
}

/// Pending relation membership changes. Members are tracked by object id only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationOp {
    target_class_name: Option<String>,
    adds: Vec<String>,
    removes: Vec<String>,
}

impl RelationOp {
    /// Build from object handles. Every object must be saved and share one class.
    pub fn new(adds: &[Object], removes: &[Object]) -> Result<Self> {
        let mut op = RelationOp::default();
        let mut add_ids = Vec::new();
        let mut remove_ids = Vec::new();
        for object in adds {
            add_ids.push(op.extract_id(object)?);
        }
        for object in removes {
            remove_ids.push(op.extract_id(object)?);
        }
        op.adds = unique_ids(add_ids);
        op.removes = unique_ids(remove_ids);
        Ok(op)
    }

    pub fn from_ids(
        target_class_name: Option<String>,
        adds: impl IntoIterator<Item = String>,
        removes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            target_class_name,
            adds: unique_ids(adds.into_iter().collect()),
            removes: unique_ids(removes.into_iter().collect()),
        }
    }

    pub fn target_class_name(&self) -> Option<&str> {
        self.target_class_name.as_deref()
    }

    pub fn adds(&self) -> &[String] {
        &self.adds
    }

    pub fn removes(&self) -> &[String] {
        &self.removes
    }

    fn extract_id(&mut self, object: &Object) -> Result<String> {
        let class_name = object.class_name();
        match &self.target_class_name {
            None => self.target_class_name = Some(class_name.to_string()),
            Some(target) if target != class_name => {
                return Err(Error::InvalidOperation(format!(
                    "tried to create a relation with two different object types: {target} and {class_name}"
                )))
            }
            Some(_) => {}
        }
        object.id().ok_or_else(|| {
            Error::UnsavedReference(
                "cannot add or remove an unsaved object from a relation".to_string(),
            )
        })
    }

    fn apply_to(&self, previous: Option<&Value>, ctx: Option<ApplyContext<'_>>) -> Result<Option<Value>> {
        match previous {
            None | Some(Value::Null) => {
                let ctx = ctx.ok_or_else(|| {
                    Error::InvalidOperation(
                        "cannot apply a relation operation without a previous value or an object and key"
                            .to_string(),
                    )
                })?;
                Ok(Some(Value::Relation(RelationValue::new(
                    ctx.parent.clone(),
                    ctx.key,
                    self.target_class_name.clone(),
                ))))
            }
            Some(Value::Relation(existing)) => {
                let mut relation = existing.clone();
                if let Some(target) = &self.target_class_name {
                    match &relation.target_class_name {
                        Some(current) if current != target => {
                            return Err(Error::TypeMismatch(format!(
                                "related object must be a {current}, but a {target} was passed in"
                            )))
                        }
                        Some(_) => {}
                        None => relation.target_class_name = Some(target.clone()),
                    }
                }
                Ok(Some(Value::Relation(relation)))
            }
            Some(other) => Err(Error::TypeMismatch(format!(
                "relation cannot be applied to a {} field",
                other.type_name()
            ))),
        }
    }

    fn merge_with(&self, previous: &Op) -> Result<Op> {
        match previous {
            Op::Unset => Err(Error::InvalidMerge(
                "you cannot modify a relation after deleting it".to_string(),
            )),
            Op::Set(Value::Relation(relation)) => {
                let mut merged = self.clone();
                if let Some(existing) = &relation.target_class_name {
                    match &self.target_class_name {
                        Some(mine) if mine != existing => {
                            return Err(Error::TypeMismatch(format!(
                                "related object must be of class {existing}, but {mine} was passed in"
                            )))
                        }
                        Some(_) => {}
                        None => merged.target_class_name = Some(existing.clone()),
                    }
                }
                Ok(Op::Relation(merged))
            }
            Op::Relation(prev) => {
                if let (Some(theirs), Some(mine)) = (&prev.target_class_name, &self.target_class_name) {
                    if theirs != mine {
                        return Err(Error::TypeMismatch(format!(
                            "related object must be of class {theirs}, but {mine} was passed in"
                        )));
                    }
                }
                let mut adds = prev.adds.clone();
                adds.retain(|id| !self.removes.contains(id));
                for id in &self.adds {
                    if !adds.contains(id) {
                        adds.push(id.clone());
                    }
                }
                let mut removes = prev.removes.clone();
                removes.retain(|id| !self.adds.contains(id));
                for id in &self.removes {
                    if !removes.contains(id) {
                        removes.push(id.clone());
                    }
                }
                Ok(Op::Relation(RelationOp {
                    target_class_name: self
                        .target_class_name
                        .clone()
                        .or_else(|| prev.target_class_name.clone()),
                    adds,
                    removes,
                }))
            }
            _ => Err(Error::InvalidMerge(
                "cannot merge a relation operation with the previous operation".to_string(),
            )),
        }
    }

    fn to_json(&self) -> JsonValue {
        let pointers = |ids: &[String]| -> Vec<JsonValue> {
            ids.iter()
                .map(|id| {
                    json!({
                        "__type": "Pointer",
                        "className": self.target_class_name,
                        "objectId": id,
                    })
                })
                .collect()
        };
        let adds = (!self.adds.is_empty())
            .then(|| json!({"__op": "AddRelation", "objects": pointers(&self.adds)}));
        let removes = (!self.removes.is_empty())
            .then(|| json!({"__op": "RemoveRelation", "objects": pointers(&self.removes)}));
        match (adds, removes) {
            (Some(adds), Some(removes)) => json!({"__op": "Batch", "ops": [adds, removes]}),
            (Some(op), None) | (None, Some(op)) => op,
            (None, None) => JsonValue::Object(Map::new()),
        }
    }
}

impl Op {
    pub fn add_unique(items: Vec<Value>) -> Self {
        Op::AddUnique(unique(items))
    }

    pub fn remove(items: Vec<Value>) -> Self {
        Op::Remove(unique(items))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Set(_) => "Set",
            Op::Unset => "Unset",
            Op::Increment(_) => "Increment",
            Op::Add(_) => "Add",
            Op::AddUnique(_) => "AddUnique",
            Op::Remove(_) => "Remove",
            Op::Relation(_) => "Relation",
        }
    }

    /// Apply without object context. Relation operations then need a previous relation value.
    pub fn apply(&self, previous: Option<&Value>) -> Result<Option<Value>> {
        self.apply_to(previous, None)
    }

    /// New value of the attribute after this operation; `None` means the attribute is unset.
    pub fn apply_to(&self, previous: Option<&Value>, ctx: Option<ApplyContext<'_>>) -> Result<Option<Value>> {
        match self {
            Op::Set(value) => Ok(Some(value.clone())),
            Op::Unset => Ok(None),
            Op::Increment(amount) => match previous {
                None => Ok(Some(Value::Number(*amount))),
                Some(Value::Number(current)) => Ok(Some(Value::Number(current.add(*amount)))),
                Some(other) => Err(Error::TypeMismatch(format!(
                    "cannot increment a non-numeric value ({})",
                    other.type_name()
                ))),
            },
            Op::Add(items) => match previous {
                None | Some(Value::Null) => Ok(Some(Value::Array(items.clone()))),
                Some(Value::Array(current)) => {
                    let mut next = current.clone();
                    next.extend(items.iter().cloned());
                    Ok(Some(Value::Array(next)))
                }
                Some(other) => Err(Error::TypeMismatch(format!(
                    "cannot add elements to a non-array value ({})",
                    other.type_name()
                ))),
            },
            Op::AddUnique(items) => match previous {
                None | Some(Value::Null) => Ok(Some(Value::Array(unique(items.clone())))),
                Some(Value::Array(current)) => {
                    let mut next = current.clone();
                    for item in items {
                        if !next.contains(item) {
                            next.push(item.clone());
                        }
                    }
                    Ok(Some(Value::Array(next)))
                }
                Some(other) => Err(Error::TypeMismatch(format!(
                    "cannot add elements to a non-array value ({})",
                    other.type_name()
                ))),
            },
            Op::Remove(items) => match previous {
                None | Some(Value::Null) => Ok(Some(Value::Array(Vec::new()))),
                Some(Value::Array(current)) => {
                    let mut next = current.clone();
                    next.retain(|existing| !items.contains(existing));
                    Ok(Some(Value::Array(next)))
                }
                Some(other) => Err(Error::TypeMismatch(format!(
                    "cannot remove elements from a non-array value ({})",
                    other.type_name()
                ))),
            },
            Op::Relation(relation) => relation.apply_to(previous, ctx),
        }
    }

    /// Fold this operation onto `previous`, the pending operation it follows.
    pub fn merge_with(&self, previous: Option<&Op>) -> Result<Op> {
        let Some(previous) = previous else {
            return Ok(self.clone());
        };
        match self {
            Op::Set(_) | Op::Unset => Ok(self.clone()),
            Op::Increment(amount) => match previous {
                Op::Set(value) => Ok(set_or_unset(self.apply(Some(value))?)),
                Op::Unset => Ok(Op::Set(Value::Number(*amount))),
                Op::Increment(prev) => Ok(Op::Increment(prev.add(*amount))),
                other => Err(incompatible(self, other)),
            },
            Op::Add(items) => match previous {
                Op::Set(value) => Ok(set_or_unset(self.apply(Some(value))?)),
                Op::Unset => Ok(Op::Set(Value::Array(items.clone()))),
                Op::Add(prev) => {
                    let mut merged = prev.clone();
                    merged.extend(items.iter().cloned());
                    Ok(Op::Add(merged))
                }
                other => Err(incompatible(self, other)),
            },
            Op::AddUnique(items) => match previous {
                Op::Set(value) => Ok(set_or_unset(self.apply(Some(value))?)),
                Op::Unset => Ok(Op::Set(Value::Array(items.clone()))),
                Op::AddUnique(prev) => {
                    let mut merged = prev.clone();
                    for item in items {
                        if !merged.contains(item) {
                            merged.push(item.clone());
                        }
                    }
                    Ok(Op::AddUnique(merged))
                }
                other => Err(incompatible(self, other)),
            },
            Op::Remove(items) => match previous {
                Op::Set(value) => Ok(set_or_unset(self.apply(Some(value))?)),
                // Removing from a deleted field leaves it deleted.
                Op::Unset => Ok(Op::Unset),
                Op::Remove(prev) => {
                    let mut merged = prev.clone();
                    for item in items {
                        if !merged.contains(item) {
                            merged.push(item.clone());
                        }
                    }
                    Ok(Op::Remove(merged))
                }
                other => Err(incompatible(self, other)),
            },
            Op::Relation(relation) => relation.merge_with(previous),
        }
    }

    /// Wire form of the operation, as sent in a save body.
    pub fn to_json(&self, offline: bool) -> Result<JsonValue> {
        let options = EncodeOptions {
            force_pointers: true,
            offline,
        };
        let objects = |items: &[Value]| -> Result<Vec<JsonValue>> {
            items.iter().map(|item| encode(item, options)).collect()
        };
        Ok(match self {
            Op::Set(value) => encode(value, options)?,
            Op::Unset => json!({"__op": "Delete"}),
            Op::Increment(amount) => json!({"__op": "Increment", "amount": amount.to_json()}),
            Op::Add(items) => json!({"__op": "Add", "objects": objects(items)?}),
            Op::AddUnique(items) => json!({"__op": "AddUnique", "objects": objects(items)?}),
            Op::Remove(items) => json!({"__op": "Remove", "objects": objects(items)?}),
            Op::Relation(relation) => relation.to_json(),
        })
    }

    /// Rebuild an operation from its wire form. `Ok(None)` means the JSON is not an
    /// operation payload at all.
    pub fn from_json(json: &JsonValue, client: &Client) -> Result<Option<Op>> {
        let Some(kind) = json.get("__op").and_then(JsonValue::as_str) else {
            return Ok(None);
        };
        let objects = || -> Result<Vec<Value>> {
            match json.get("objects") {
                Some(objects @ JsonValue::Array(_)) => match decode(objects, client)? {
                    Value::Array(items) => Ok(items),
                    _ => Ok(Vec::new()),
                },
                _ => Err(Error::InvalidJson(format!("{kind} operation requires an objects array"))),
            }
        };
        Ok(Some(match kind {
            "Delete" => Op::Unset,
            "Increment" => match json.get("amount") {
                Some(JsonValue::Number(n)) => Op::Increment(Number::from_json(n)),
                _ => {
                    return Err(Error::TypeMismatch(
                        "increment operation must carry a numeric amount".to_string(),
                    ))
                }
            },
            "Add" => Op::Add(objects()?),
            "AddUnique" => Op::add_unique(objects()?),
            "Remove" => Op::remove(objects()?),
            "AddRelation" => {
                let (target, ids) = relation_pointers(json)?;
                Op::Relation(RelationOp::from_ids(target, ids, Vec::new()))
            }
            "RemoveRelation" => {
                let (target, ids) = relation_pointers(json)?;
                Op::Relation(RelationOp::from_ids(target, Vec::new(), ids))
            }
            "Batch" => {
                let mut target = None;
                let mut adds = Vec::new();
                let mut removes = Vec::new();
                for op in json.get("ops").and_then(JsonValue::as_array).into_iter().flatten() {
                    let (class_name, ids) = relation_pointers(op)?;
                    target = target.or(class_name);
                    match op.get("__op").and_then(JsonValue::as_str) {
                        Some("AddRelation") => adds.extend(ids),
                        Some("RemoveRelation") => removes.extend(ids),
                        _ => {}
                    }
                }
                Op::Relation(RelationOp::from_ids(target, adds, removes))
            }
            _ => return Ok(None),
        }))
    }
}

fn relation_pointers(json: &JsonValue) -> Result<(Option<String>, Vec<String>)> {
    let mut target: Option<String> = None;
    let mut ids = Vec::new();
    for pointer in json.get("objects").and_then(JsonValue::as_array).into_iter().flatten() {
        let class_name = pointer.get("className").and_then(JsonValue::as_str);
        let id = pointer.get("objectId").and_then(JsonValue::as_str).ok_or_else(|| {
            Error::UnsavedReference("relation members must carry an objectId".to_string())
        })?;
        if let Some(class_name) = class_name {
            match &target {
                Some(existing) if existing != class_name => {
                    return Err(Error::InvalidOperation(format!(
                        "tried to create a relation with two different object types: {existing} and {class_name}"
                    )))
                }
                Some(_) => {}
                None => target = Some(class_name.to_string()),
            }
        }
        ids.push(id.to_string());
    }
    Ok((target, ids))
}

fn set_or_unset(value: Option<Value>) -> Op {
    match value {
        Some(value) => Op::Set(value),
        None => Op::Unset,
    }
}

fn incompatible(op: &Op, previous: &Op) -> Error {
    Error::InvalidMerge(format!(
        "cannot merge {} operation with the previous {} operation",
        op.kind(),
        previous.kind()
    ))
}

fn unique(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn unique_ids(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::traits::NoopRestController;
    use proptest::prelude::*;

    fn client() -> Client {
        Client::new(ClientConfig::default(), NoopRestController)
    }

    fn parent() -> ParentRef {
        ParentRef {
            class_name: "Post".into(),
            object_id: Some("p1".into()),
        }
    }

    #[test]
    fn increment_rejects_non_numeric_previous() {
        let err = Op::Increment(Number::Int(1))
            .apply(Some(&Value::from("ten")))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn increment_merges() {
        let inc = Op::Increment(Number::Int(3));
        assert_eq!(
            inc.merge_with(Some(&Op::Set(Value::from(10)))).unwrap(),
            Op::Set(Value::from(13))
        );
        assert_eq!(inc.merge_with(Some(&Op::Unset)).unwrap(), Op::Set(Value::from(3)));
        assert_eq!(
            inc.merge_with(Some(&Op::Increment(Number::Int(2)))).unwrap(),
            Op::Increment(Number::Int(5))
        );
        assert!(matches!(
            inc.merge_with(Some(&Op::Add(vec![]))),
            Err(Error::InvalidMerge(_))
        ));
    }

    #[test]
    fn add_concatenates_and_keeps_duplicates() {
        let op = Op::Add(vec![Value::from(1), Value::from(1)]);
        assert_eq!(
            op.apply(Some(&Value::from(vec![1]))).unwrap(),
            Some(Value::from(vec![1, 1, 1]))
        );
        assert_eq!(op.apply(Some(&Value::Null)).unwrap(), Some(Value::from(vec![1, 1])));
        assert_eq!(
            op.merge_with(Some(&Op::Add(vec![Value::from(0)]))).unwrap(),
            Op::Add(vec![Value::from(0), Value::from(1), Value::from(1)])
        );
        assert!(op.apply(Some(&Value::from("x"))).is_err());
    }

    #[test]
    fn add_unique_skips_existing_values() {
        let op = Op::add_unique(vec![Value::from("b"), Value::from("c"), Value::from("b")]);
        assert_eq!(
            op.apply(Some(&Value::from(vec!["a", "b"]))).unwrap(),
            Some(Value::from(vec!["a", "b", "c"]))
        );
        assert_eq!(op.apply(None).unwrap(), Some(Value::from(vec!["b", "c"])));
    }

    #[test]
    fn add_unique_compares_objects_by_identity_key() {
        let client = client();
        let first = client.create_without_data("Tag", "t1");
        let second = client.create_without_data("Tag", "t1");
        let op = Op::add_unique(vec![Value::Pointer(second)]);
        let applied = op
            .apply(Some(&Value::Array(vec![Value::Pointer(first)])))
            .unwrap()
            .unwrap();
        assert_eq!(applied.as_array().unwrap().len(), 1);
    }

    #[test]
    fn remove_drops_every_occurrence() {
        let op = Op::remove(vec![Value::from(1)]);
        assert_eq!(
            op.apply(Some(&Value::from(vec![1, 2, 1, 3]))).unwrap(),
            Some(Value::from(vec![2, 3]))
        );
        assert_eq!(op.apply(None).unwrap(), Some(Value::Array(vec![])));
    }

    #[test]
    fn remove_after_unset_stays_unset() {
        // Pinned behaviour: unlike Add, removing on top of a delete keeps the delete.
        let op = Op::remove(vec![Value::from(1)]);
        assert_eq!(op.merge_with(Some(&Op::Unset)).unwrap(), Op::Unset);
        let add = Op::Add(vec![Value::from(1)]);
        assert_eq!(
            add.merge_with(Some(&Op::Unset)).unwrap(),
            Op::Set(Value::from(vec![1]))
        );
    }

    #[test]
    fn remove_merge_unions_items() {
        let op = Op::remove(vec![Value::from(2), Value::from(3)]);
        assert_eq!(
            op.merge_with(Some(&Op::remove(vec![Value::from(1), Value::from(2)])))
                .unwrap(),
            Op::Remove(vec![Value::from(1), Value::from(2), Value::from(3)])
        );
    }

    #[test]
    fn relation_requires_saved_members_of_one_class() {
        let client = client();
        let saved = client.create_without_data("Tag", "t1");
        let other = client.create_without_data("User", "u1");
        let unsaved = client.create("Tag");

        assert!(matches!(
            RelationOp::new(&[unsaved], &[]),
            Err(Error::UnsavedReference(_))
        ));
        assert!(matches!(
            RelationOp::new(&[saved.clone(), other], &[]),
            Err(Error::InvalidOperation(_))
        ));
        let op = RelationOp::new(&[saved], &[]).unwrap();
        assert_eq!(op.target_class_name(), Some("Tag"));
        assert_eq!(op.adds(), &["t1".to_string()]);
    }

    #[test]
    fn relation_merge_cancels_opposite_changes() {
        let first = Op::Relation(RelationOp::from_ids(
            Some("Tag".into()),
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
        ));
        let second = Op::Relation(RelationOp::from_ids(
            Some("Tag".into()),
            vec!["c".to_string()],
            vec!["a".to_string()],
        ));
        let Op::Relation(merged) = second.merge_with(Some(&first)).unwrap() else {
            panic!("expected relation op");
        };
        assert_eq!(merged.adds(), &["b".to_string(), "c".to_string()]);
        assert_eq!(merged.removes(), &["a".to_string()]);
    }

    #[test]
    fn relation_cannot_follow_unset_or_increment() {
        let op = Op::Relation(RelationOp::from_ids(Some("Tag".into()), vec!["a".to_string()], vec![]));
        assert!(matches!(op.merge_with(Some(&Op::Unset)), Err(Error::InvalidMerge(_))));
        assert!(matches!(
            op.merge_with(Some(&Op::Increment(Number::Int(1)))),
            Err(Error::InvalidMerge(_))
        ));
        assert!(matches!(
            Op::Increment(Number::Int(1)).merge_with(Some(&op)),
            Err(Error::InvalidMerge(_))
        ));
    }

    #[test]
    fn relation_apply_needs_context_or_previous_value() {
        let op = Op::Relation(RelationOp::from_ids(Some("Tag".into()), vec!["a".to_string()], vec![]));
        assert!(op.apply(None).is_err());

        let parent = parent();
        let ctx = ApplyContext {
            parent: &parent,
            key: "tags",
        };
        let value = op.apply_to(None, Some(ctx)).unwrap().unwrap();
        let relation = value.as_relation().unwrap();
        assert_eq!(relation.target_class_name.as_deref(), Some("Tag"));
        assert_eq!(relation.key.as_deref(), Some("tags"));

        let mismatch = RelationValue {
            target_class_name: Some("User".into()),
            ..RelationValue::default()
        };
        assert!(op.apply(Some(&Value::Relation(mismatch))).is_err());
        assert!(op.apply(Some(&Value::from(1))).is_err());
    }

    #[test]
    fn relation_wire_forms() {
        let add_only = RelationOp::from_ids(Some("Tag".into()), vec!["a".to_string()], vec![]);
        assert_eq!(
            Op::Relation(add_only).to_json(false).unwrap(),
            json!({"__op": "AddRelation", "objects": [
                {"__type": "Pointer", "className": "Tag", "objectId": "a"}
            ]})
        );

        let both = Op::Relation(RelationOp::from_ids(
            Some("Tag".into()),
            vec!["a".to_string()],
            vec!["b".to_string()],
        ));
        let json = both.to_json(false).unwrap();
        assert_eq!(json["__op"], json!("Batch"));
        assert_eq!(Op::from_json(&json, &client()).unwrap(), Some(both));
    }

    #[test]
    fn unknown_discriminator_is_not_an_operation() {
        let client = client();
        assert_eq!(Op::from_json(&json!({"__op": "Explode"}), &client).unwrap(), None);
        assert_eq!(Op::from_json(&json!({"plain": 1}), &client).unwrap(), None);
    }

    #[test]
    fn wire_round_trip_for_list_ops() {
        let client = client();
        let pointer = Value::Pointer(client.create_without_data("Tag", "t1"));
        let ops = [
            Op::Unset,
            Op::Increment(Number::Int(4)),
            Op::Add(vec![Value::from(1), pointer.clone()]),
            Op::add_unique(vec![Value::from("x"), pointer.clone()]),
            Op::remove(vec![pointer]),
        ];
        for op in ops {
            let json = op.to_json(false).unwrap();
            assert_eq!(Op::from_json(&json, &client).unwrap(), Some(op));
        }
    }

    proptest! {
        #[test]
        fn set_wins_over_anything(v in any::<i64>(), prev in any::<i64>()) {
            let set = Op::Set(Value::from(v));
            for previous in [Op::Unset, Op::Increment(Number::Int(prev)), Op::Set(Value::from(prev))] {
                prop_assert_eq!(set.merge_with(Some(&previous)).unwrap(), set.clone());
            }
            prop_assert_eq!(set.apply(Some(&Value::from(prev))).unwrap(), Some(Value::from(v)));
        }

        #[test]
        fn increments_accumulate(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            let merged = Op::Increment(Number::Int(a))
                .merge_with(Some(&Op::Increment(Number::Int(b))))
                .unwrap();
            prop_assert_eq!(merged.apply(None).unwrap(), Some(Value::from(a + b)));
        }

        #[test]
        fn increment_survives_the_wire(n in any::<i64>(), prev in -1000i64..1000) {
            let client = client();
            let op = Op::Increment(Number::Int(n));
            let decoded = Op::from_json(&op.to_json(false).unwrap(), &client).unwrap().unwrap();
            prop_assert_eq!(
                decoded.apply(Some(&Value::from(prev))).unwrap(),
                op.apply(Some(&Value::from(prev))).unwrap()
            );
        }
    }
}
