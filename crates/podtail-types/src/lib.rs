//! Shared types for podtail
//!
//! This crate contains the identifiers and the log event value passed
//! between the datastore, the controller and the output writers.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Resource Identity
// ============================================================================

/// Namespaced identity of a cluster object
///
/// Equality and ordering use the (namespace, name) pair. An empty namespace
/// or an empty name acts as a wildcard when the id is used as a filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Id selecting every object in a namespace
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::new(namespace, "")
    }

    /// Check whether `other` falls under this id, treating empty parts as wildcards
    pub fn matches(&self, other: &ResourceId) -> bool {
        (self.namespace.is_empty() || self.namespace == other.namespace)
            && (self.name.is_empty() || self.name == other.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid object id '{0}': expected NAME or NAMESPACE/NAME")]
pub struct ParseIdError(pub String);

impl FromStr for ResourceId {
    type Err = ParseIdError;

    /// Parse `NAME` or `NAMESPACE/NAME`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(Self::new(*namespace, *name)),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// One container log stream: pod identity, container name and node
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventSource {
    pub id: ResourceId,
    pub container: String,
    pub node: String,
}

impl EventSource {
    pub fn new(id: ResourceId, container: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            id,
            container: container.into(),
            node: node.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.id.namespace
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.id.namespace, self.id.name, self.container)
    }
}

/// A single log line from one source, without its trailing newline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    source: EventSource,
    log: Vec<u8>,
}

impl Event {
    pub fn new(source: EventSource, log: Vec<u8>) -> Self {
        Self { source, log }
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Raw line bytes
    pub fn log(&self) -> &[u8] {
        &self.log
    }

    /// Line content as text, replacing invalid UTF-8
    pub fn log_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.log)
    }

    /// Try to parse the line as a JSON document
    pub fn log_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.log).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        let id: ResourceId = "kube-system/coredns".parse().unwrap();
        assert_eq!(id, ResourceId::new("kube-system", "coredns"));

        let id: ResourceId = "web".parse().unwrap();
        assert_eq!(id, ResourceId::new("", "web"));

        assert!("".parse::<ResourceId>().is_err());
        assert!("a/b/c".parse::<ResourceId>().is_err());
        assert!("ns/".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_id_wildcards() {
        let pod = ResourceId::new("default", "web-1");
        assert!(ResourceId::new("", "web-1").matches(&pod));
        assert!(ResourceId::namespace("default").matches(&pod));
        assert!(!ResourceId::namespace("prod").matches(&pod));
        assert!(!ResourceId::new("default", "web-2").matches(&pod));
    }

    #[test]
    fn test_id_ordering() {
        let mut ids = vec![
            ResourceId::new("b", "a"),
            ResourceId::new("a", "z"),
            ResourceId::new("a", "b"),
        ];
        ids.sort();
        assert_eq!(ids[0], ResourceId::new("a", "b"));
        assert_eq!(ids[2], ResourceId::new("b", "a"));
    }

    #[test]
    fn test_event_json() {
        let source = EventSource::new(ResourceId::new("ns", "pod"), "app", "node-1");
        let event = Event::new(source.clone(), br#"{"level":"info"}"#.to_vec());
        assert_eq!(event.log_json().unwrap()["level"], "info");
        assert_eq!(source.to_string(), "ns/pod[app]");

        let plain = Event::new(source, b"hello".to_vec());
        assert!(plain.log_json().is_none());
        assert_eq!(plain.log_lossy(), "hello");
    }
}
