//! Hierarchical service identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SEPARATOR: char = '/';

/// Structured name of one service in the container, e.g. `ep1/mgmt`.
///
/// Names are compared segment by segment and are cheap to clone. Every segment is
/// non-empty and never contains the `/` separator.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    segments: Arc<[String]>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceNameError {
    #[error("service name must have at least one segment")]
    Empty,
    #[error("invalid service name segment '{0}'")]
    InvalidSegment(String),
}

impl ServiceName {
    /// Build a name from its segments.
    pub fn of<I, S>(segments: I) -> Result<Self, ServiceNameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(ServiceNameError::Empty);
        }
        for s in &segments {
            validate_segment(s)?;
        }
        Ok(Self {
            segments: segments.into(),
        })
    }

    /// Parse the `a/b/c` form.
    pub fn parse(raw: &str) -> Result<Self, ServiceNameError> {
        Self::of(raw.split(SEPARATOR))
    }

    /// Child name with one more segment.
    pub fn append(&self, segment: &str) -> Result<Self, ServiceNameError> {
        validate_segment(segment)?;
        let mut segments = self.segments.to_vec();
        segments.push(segment.to_string());
        Ok(Self {
            segments: segments.into(),
        })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec().into(),
        })
    }

    /// True if `other` lives strictly below this name.
    pub fn is_parent_of(&self, other: &ServiceName) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn simple_name(&self) -> &str {
        // at least one segment is guaranteed by construction
        self.segments.last().map(String::as_str).unwrap_or_default()
    }
}

fn validate_segment(segment: &str) -> Result<(), ServiceNameError> {
    if segment.is_empty() || segment.contains(SEPARATOR) || segment.trim() != segment {
        return Err(ServiceNameError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for s in self.segments.iter() {
            if !first {
                write!(f, "{SEPARATOR}")?;
            }
            f.write_str(s)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({self})")
    }
}

impl FromStr for ServiceName {
    type Err = ServiceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ServiceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
