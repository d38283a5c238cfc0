//! Work item identity.
//!
//! A [`WorkItem`] names *what changed* (kind, event type, namespace/name),
//! never the object itself: callbacks re-read current state from their
//! cache when they run.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{Error, Result};

/// Change notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace/name pair identifying an object within a kind.
///
/// Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name` or a bare `name`.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(Self::new("", name)),
            (Some(namespace), Some(name), None) => Ok(Self::new(namespace, name)),
            _ => Err(Error::malformed_object(format!(
                "unexpected key format: {:?}",
                key
            ))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Anything a queue key can be derived from.
///
/// Key extraction is the only thing the engine needs from a payload.
pub trait Object: Send + Sync {
    fn object_key(&self) -> Result<ObjectKey>;
}

impl Object for ObjectKey {
    fn object_key(&self) -> Result<ObjectKey> {
        Ok(self.clone())
    }
}

/// Reads `metadata.namespace` and `metadata.name`, the way API objects
/// serialize. Absent fields are treated as empty.
impl Object for serde_json::Value {
    fn object_key(&self) -> Result<ObjectKey> {
        let metadata = self
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| Error::malformed_object("object has no metadata"))?;

        let field = |field: &str| -> Result<String> {
            match metadata.get(field) {
                None | Some(serde_json::Value::Null) => Ok(String::new()),
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(other) => Err(Error::malformed_object(format!(
                    "metadata.{} is not a string: {}",
                    field, other
                ))),
            }
        };

        Ok(ObjectKey::new(field("namespace")?, field("name")?))
    }
}

/// Tombstone delivered when a watch missed an object's deletion and only
/// the last known key (and possibly state) is available.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedFinalStateUnknown {
    pub key: String,
    pub obj: Option<serde_json::Value>,
}

impl Object for DeletedFinalStateUnknown {
    fn object_key(&self) -> Result<ObjectKey> {
        ObjectKey::parse(&self.key)
    }
}

/// Per-key serialisation identity: at most one in-flight item per ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub kind: String,
    pub key: ObjectKey,
}

/// The unit of work placed on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub kind: String,
    pub event_type: EventType,
    pub key: ObjectKey,
}

impl WorkItem {
    pub fn new(kind: impl Into<String>, event_type: EventType, key: ObjectKey) -> Self {
        Self {
            kind: kind.into(),
            event_type,
            key,
        }
    }

    /// Build an item from a raw payload.
    pub fn from_object(kind: &str, event_type: EventType, obj: &dyn Object) -> Result<Self> {
        Ok(Self::new(kind, event_type, obj.object_key()?))
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            kind: self.kind.clone(),
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.event_type, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_from_json_metadata() {
        let pod = json!({
            "kind": "Pod",
            "metadata": { "namespace": "default", "name": "web-0" }
        });
        assert_eq!(pod.object_key().unwrap(), ObjectKey::new("default", "web-0"));
    }

    #[test]
    fn test_empty_metadata_yields_empty_key() {
        let obj = json!({ "metadata": {} });
        let key = obj.object_key().unwrap();
        assert_eq!(key, ObjectKey::default());
        assert_eq!(key.to_string(), "");
    }

    #[test]
    fn test_missing_metadata_is_malformed() {
        let err = json!({ "spec": {} }).object_key().unwrap_err();
        assert!(matches!(err, Error::MalformedObject(_)));

        let err = json!("just a string").object_key().unwrap_err();
        assert!(matches!(err, Error::MalformedObject(_)));
    }

    #[test]
    fn test_non_string_name_is_malformed() {
        let err = json!({ "metadata": { "name": 7 } }).object_key().unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn test_display_omits_empty_namespace() {
        assert_eq!(ObjectKey::new("", "node-1").to_string(), "node-1");
        assert_eq!(ObjectKey::new("kube-system", "dns").to_string(), "kube-system/dns");
    }

    #[test]
    fn test_parse_rejects_extra_segments() {
        assert!(ObjectKey::parse("a/b/c").is_err());
    }

    #[test]
    fn test_tombstone_key() {
        let tombstone = DeletedFinalStateUnknown {
            key: "default/web-0".to_string(),
            obj: None,
        };
        assert_eq!(
            tombstone.object_key().unwrap(),
            ObjectKey::new("default", "web-0")
        );
    }

    #[test]
    fn test_item_ref_ignores_event_type() {
        let key = ObjectKey::new("ns", "a");
        let add = WorkItem::new("Foo", EventType::Add, key.clone());
        let delete = WorkItem::new("Foo", EventType::Delete, key);
        assert_ne!(add, delete);
        assert_eq!(add.item_ref(), delete.item_ref());
    }

    #[test]
    fn test_item_ref_separates_kinds() {
        let key = ObjectKey::new("ns", "a");
        let foo = WorkItem::new("Foo", EventType::Add, key.clone());
        let bar = WorkItem::new("Bar", EventType::Add, key);
        assert_ne!(foo.item_ref(), bar.item_ref());
    }

    proptest! {
        #[test]
        fn parse_inverts_display(namespace in "[a-z0-9-]{0,12}", name in "[a-z0-9-]{1,12}") {
            let key = ObjectKey::new(namespace, name);
            prop_assert_eq!(ObjectKey::parse(&key.to_string()).unwrap(), key);
        }
    }
}
