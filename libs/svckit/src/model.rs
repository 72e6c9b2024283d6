//! Management model tree: persisted configuration state, mutated only in the MODEL phase.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path element '{0}' must have the form key=value")]
    MalformedElement(String),
    #[error("path address must start with '/': '{0}'")]
    NotAbsolute(String),
}

/// One `key=value` step of a resource address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    pub key: String,
    pub value: String,
}

impl PathElement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for PathElement {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((k, v)) if !k.is_empty() && !v.is_empty() && !v.contains('=') => {
                Ok(Self::new(k, v))
            }
            _ => Err(PathError::MalformedElement(s.to_string())),
        }
    }
}

/// Address of a resource, displayed as `/key=value/key=value`. The empty address is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PathAddress(Vec<PathElement>);

impl PathAddress {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(elements: impl IntoIterator<Item = PathElement>) -> Self {
        Self(elements.into_iter().collect())
    }

    pub fn append(&self, element: PathElement) -> Self {
        let mut elements = self.0.clone();
        elements.push(element);
        Self(elements)
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    pub fn parent(&self) -> Option<PathAddress> {
        let (_, head) = self.0.split_last()?;
        Some(Self(head.to_vec()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for e in &self.0 {
            write!(f, "/{e}")?;
        }
        Ok(())
    }
}

impl FromStr for PathAddress {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| PathError::NotAbsolute(s.to_string()))?;
        rest.split('/')
            .filter(|seg| !seg.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl Serialize for PathAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Mutable tree node holding the persisted state of one resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelNode {
    defined: bool,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    children: BTreeMap<String, ModelNode>,
}

impl ModelNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Mark the node as a defined resource with no attributes.
    pub fn set_empty_object(&mut self) {
        self.defined = true;
        self.attributes.clear();
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.defined = true;
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn child(&self, element: &PathElement) -> Option<&ModelNode> {
        self.children.get(&element.to_string())
    }

    pub fn child_mut(&mut self, element: &PathElement) -> Option<&mut ModelNode> {
        self.children.get_mut(&element.to_string())
    }

    pub fn get_or_create_child(&mut self, element: &PathElement) -> &mut ModelNode {
        self.children.entry(element.to_string()).or_default()
    }

    pub fn remove_child(&mut self, element: &PathElement) -> Option<ModelNode> {
        self.children.remove(&element.to_string())
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ModelNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn navigate(&self, address: &PathAddress) -> Option<&ModelNode> {
        address
            .elements()
            .iter()
            .try_fold(self, |node, e| node.child(e))
    }

    pub fn navigate_mut(&mut self, address: &PathAddress) -> Option<&mut ModelNode> {
        address
            .elements()
            .iter()
            .try_fold(self, |node, e| node.child_mut(e))
    }

    /// Put back the subtree recorded at `address` (or its absence).
    pub(crate) fn restore(&mut self, address: &PathAddress, previous: Option<ModelNode>) {
        let Some((last, head)) = address.elements().split_last() else {
            *self = previous.unwrap_or_default();
            return;
        };
        match previous {
            Some(node) => {
                let parent = head
                    .iter()
                    .fold(self, |node, e| node.get_or_create_child(e));
                parent.children.insert(last.to_string(), node);
            }
            None => {
                let parent_addr = PathAddress(head.to_vec());
                if let Some(parent) = self.navigate_mut(&parent_addr) {
                    parent.remove_child(last);
                }
            }
        }
    }

    /// JSON view: attributes plus children keyed by `key=value`.
    pub fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, child) in &self.children {
            map.insert(k.clone(), child.to_json());
        }
        if map.is_empty() && !self.defined {
            Value::Null
        } else {
            Value::Object(map)
        }
    }
}

/// Shared handle to the root of the management model.
#[derive(Clone, Default)]
pub struct ManagementModel {
    root: Arc<RwLock<ModelNode>>,
}

impl ManagementModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ModelNode> {
        self.root.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ModelNode> {
        self.root.write()
    }

    /// Clone of the resource at `address`, if present.
    pub fn read_resource(&self, address: &PathAddress) -> Option<ModelNode> {
        self.root.read().navigate(address).cloned()
    }

    pub fn snapshot(&self) -> ModelNode {
        self.root.read().clone()
    }
}

impl fmt::Debug for ManagementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagementModel")
            .field(&self.root.read().to_json())
            .finish()
    }
}
