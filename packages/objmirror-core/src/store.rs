//! The two state storage strategies.
//!
//! [`SingleInstanceStore`] keys state by `(class, id)` so every handle to the same backend
//! object shares one record. [`UniqueInstanceStore`] keeps the record in the handle itself so
//! separate handles never see each other's edits.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use log::trace;

use crate::ids::ObjectKey;
use crate::object::Object;
use crate::state::{State, StateRef};
use crate::traits::StateStore;

#[derive(Debug, Default)]
pub struct SingleInstanceStore {
    objects: RefCell<HashMap<String, HashMap<String, StateRef>>>,
}

impl SingleInstanceStore {
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects
            .borrow()
            .get(&key.class_name)
            .is_some_and(|by_id| by_id.contains_key(&key.id))
    }

    /// Number of state records held across all classes.
    pub fn len(&self) -> usize {
        self.objects.borrow().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for SingleInstanceStore {
    fn get_state(&self, object: &Object) -> Option<StateRef> {
        self.objects
            .borrow()
            .get(object.class_name())
            .and_then(|by_id| by_id.get(&object.state_id()))
            .cloned()
    }

    fn initialize_state(&self, object: &Object, initial: Option<StateRef>) -> StateRef {
        let id = object.state_id();
        let mut objects = self.objects.borrow_mut();
        let by_id = objects.entry(object.class_name().to_string()).or_default();
        match initial {
            Some(state) => {
                trace!("installing state for {}:{id}", object.class_name());
                by_id.insert(id, state.clone());
                state
            }
            None => by_id
                .entry(id)
                .or_insert_with_key(|id| {
                    trace!("initializing state for {}:{id}", object.class_name());
                    State::default().into_ref()
                })
                .clone(),
        }
    }

    fn remove_state(&self, object: &Object) -> Option<StateRef> {
        let mut objects = self.objects.borrow_mut();
        let by_id = objects.get_mut(object.class_name())?;
        let removed = by_id.remove(&object.state_id());
        if by_id.is_empty() {
            objects.remove(object.class_name());
        }
        if removed.is_some() {
            trace!("removed state for {}:{}", object.class_name(), object.state_id());
        }
        removed
    }

    /// Handles converge on shared state by key, so only the id is carried over.
    fn duplicate_state(&self, source: &Object, dest: &Object) {
        dest.set_id(source.id());
    }

    fn clear_all_state(&self) {
        self.objects.borrow_mut().clear();
    }
}

/// State lives in each handle's slot, tagged with the store generation that created it.
/// Clearing bumps the generation, which orphans every existing slot at once.
#[derive(Debug, Default)]
pub struct UniqueInstanceStore {
    generation: Cell<u64>,
}

impl StateStore for UniqueInstanceStore {
    fn get_state(&self, object: &Object) -> Option<StateRef> {
        let generation = self.generation.get();
        object
            .state_slot()
            .borrow()
            .as_ref()
            .filter(|(tag, _)| *tag == generation)
            .map(|(_, state)| state.clone())
    }

    fn initialize_state(&self, object: &Object, initial: Option<StateRef>) -> StateRef {
        if initial.is_none() {
            if let Some(existing) = self.get_state(object) {
                return existing;
            }
            trace!("initializing instance state for {}", object.class_name());
        }
        let state = initial.unwrap_or_else(|| State::default().into_ref());
        *object.state_slot().borrow_mut() = Some((self.generation.get(), state.clone()));
        state
    }

    fn remove_state(&self, object: &Object) -> Option<StateRef> {
        let state = self.get_state(object)?;
        object.state_slot().borrow_mut().take();
        Some(state)
    }

    fn duplicate_state(&self, source: &Object, dest: &Object) {
        let Some(source_state) = self.get_state(source) else {
            return;
        };
        let dest_state = self.initialize_state(dest, None);
        if std::rc::Rc::ptr_eq(&source_state, &dest_state) {
            return;
        }
        let source = source_state.borrow();
        let mut dest = dest_state.borrow_mut();
        dest.server_data = source.server_data.clone();
        dest.pending_ops = source.pending_ops.clone();
        dest.seals = source.seals.clone();
        dest.next_seal = source.next_seal;
        dest.object_cache = source.object_cache.clone();
        dest.existed = source.existed;
    }

    fn clear_all_state(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
    }
}
