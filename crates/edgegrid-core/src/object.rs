//! Traits that let the store, the caches, and the lifecycle code handle
//! every resource type through one mechanism.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, CoreResult};
use crate::types::TrackedState;

/// A structured resource key with a canonical string encoding.
///
/// The encoding is the compact JSON rendering of the key. Field order is
/// fixed by the struct definition, so equal keys always encode equally.
pub trait ObjKey:
    Clone + Debug + Display + Default + Eq + Ord + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn key_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn from_key_string(id: &str) -> CoreResult<Self> {
        serde_json::from_str(id).map_err(|e| CoreError::KeyDecode(e.to_string()))
    }

    /// Reject keys with empty or malformed name fields.
    fn validate(&self) -> CoreResult<()>;
}

/// An object persisted in the store under `<region>/<tag>/<key>`.
pub trait StoredObject:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: ObjKey;

    /// Human readable type name, used in messages and stream keys.
    const TYPE_NAME: &'static str;

    /// Numeric tag that namespaces the type in the store. Types sort and
    /// range-scan independently by tag.
    const TYPE_TAG: u16;

    fn key(&self) -> &Self::Key;
}

/// A desired-state object driven through the lifecycle state machine.
pub trait TrackedObject: StoredObject {
    fn state(&self) -> TrackedState;
    fn set_state(&mut self, state: TrackedState);
    fn errors(&self) -> &[String];
    fn set_errors(&mut self, errors: Vec<String>);
    fn status(&self) -> &str;
    fn set_status(&mut self, status: String);
}

/// Objects stamped with the id of the agent connection that wrote them.
pub trait NotifyTagged {
    fn notify_id(&self) -> u64;
}

/// An agent-observed record paired with a tracked object of the same key.
pub trait InfoObject: StoredObject + NotifyTagged {
    fn state(&self) -> TrackedState;
    fn errors(&self) -> &[String];
    fn status(&self) -> &str;
}
