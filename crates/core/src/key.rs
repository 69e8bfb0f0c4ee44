use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::{DeletedObject, KeyError};

/// Identity of a watched object: `namespace/name`, or just `name` when cluster scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// An empty namespace is treated as cluster scoped.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    /// Key of a live object, from `metadata.namespace` and `metadata.name`.
    pub fn of<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// Key for a delete notification: tombstones carry their key, live objects are keyed
/// from their metadata.
pub fn deletion_handling_key<K: Resource>(obj: &DeletedObject<K>) -> Result<ObjectKey, KeyError> {
    match obj {
        DeletedObject::Tombstone { key, .. } => Ok(key.clone()),
        DeletedObject::Object(o) => ObjectKey::of(o.as_ref()),
    }
}
