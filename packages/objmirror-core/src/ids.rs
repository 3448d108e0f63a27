use uuid::Uuid;

/// Prefix of ids handed out locally before the backend assigns a real one.
pub const LOCAL_ID_PREFIX: &str = "local";

/// Generate a fresh temporary id for an object that has never been saved.
pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// `(class, id)` key used by the single-instance store. The id is the server id when one is
/// known and the local id otherwise.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectKey {
    pub class_name: String,
    pub id: String,
}

impl ObjectKey {
    pub fn new(class_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            id: id.into(),
        }
    }
}

/// The owning object of a relation, as far as relation values need to know about it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ParentRef {
    pub class_name: String,
    pub object_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_prefixed_and_unique() {
        let a = new_local_id();
        let b = new_local_id();
        assert!(is_local_id(&a));
        assert_ne!(a, b);
    }
}
