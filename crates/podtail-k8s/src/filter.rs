//! Composable object filters
//!
//! A [`Filter`] is an ordered chain of [`Stage`]s; an object passes when it
//! passes every stage. Stages are static except [`Stage::Owners`], whose
//! membership is replaced whenever the watched owner objects change.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::RwLock;
use tokio::sync::watch;

use podtail_types::ResourceId;

use crate::error::{Error, Result};
use crate::selector::LabelSelector;
use crate::source::WatchedResource;

/// Objects that can be run through a [`Filter`]
pub trait Selectable: WatchedResource {
    /// Node the object is bound to, for kinds that have one
    fn node_name(&self) -> Option<&str> {
        None
    }
}

impl Selectable for Pod {
    fn node_name(&self) -> Option<&str> {
        self.spec.as_ref()?.node_name.as_deref()
    }
}

/// Identity of a namespaced object
pub fn resource_id<K: ResourceExt>(obj: &K) -> ResourceId {
    ResourceId::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Pod selector of a single owner object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerSelector {
    pub namespace: String,
    pub selector: LabelSelector,
}

impl OwnerSelector {
    fn matches(&self, id: &ResourceId, labels: &BTreeMap<String, String>) -> bool {
        self.namespace == id.namespace && self.selector.matches(labels)
    }
}

struct MembershipInner {
    kind: &'static str,
    owners: RwLock<Option<Vec<OwnerSelector>>>,
    initialized: watch::Sender<bool>,
}

/// Live set of owner selectors for one owner kind
///
/// Until the first membership is installed nothing matches.
#[derive(Clone)]
pub struct OwnerMembership {
    inner: Arc<MembershipInner>,
}

impl OwnerMembership {
    pub fn new(kind: &'static str) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            inner: Arc::new(MembershipInner {
                kind,
                owners: RwLock::new(None),
                initialized,
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    /// Swap in a new set of owner selectors
    pub fn replace(&self, owners: Vec<OwnerSelector>) {
        *self.inner.owners.write() = Some(owners);
    }

    pub fn matches(&self, id: &ResourceId, labels: &BTreeMap<String, String>) -> bool {
        self.inner
            .owners
            .read()
            .as_ref()
            .is_some_and(|owners| owners.iter().any(|o| o.matches(id, labels)))
    }

    /// Number of owners currently contributing selectors
    pub fn len(&self) -> usize {
        self.inner.owners.read().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that the first membership has been applied to the pod view
    pub fn mark_initialized(&self) {
        self.inner.initialized.send_replace(true);
    }

    /// Wait until the first membership has been applied
    pub async fn initialized(&self) {
        let mut rx = self.inner.initialized.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl fmt::Debug for OwnerMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerMembership")
            .field("kind", &self.inner.kind)
            .field("owners", &self.len())
            .finish()
    }
}

/// One narrowing step of a [`Filter`]
#[derive(Clone, Debug)]
pub enum Stage {
    /// Objects whose id matches any of the given ids (empty parts are wildcards)
    Ids {
        name: &'static str,
        ids: Vec<ResourceId>,
    },
    /// Objects whose labels match every given selector
    Labels(Vec<LabelSelector>),
    /// Objects whose labels match none of the given selectors
    Ignore(Vec<LabelSelector>),
    /// Objects bound to one of the given nodes
    Nodes(BTreeSet<String>),
    /// Pods selected by the current owner objects
    Owners(OwnerMembership),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Ids { name, .. } => *name,
            Self::Labels(_) => "labels",
            Self::Ignore(_) => "ignore",
            Self::Nodes(_) => "node",
            Self::Owners(m) => m.kind(),
        }
    }

    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Ids { ids, .. } => {
                if let Some(id) = ids.iter().find(|id| id.namespace.is_empty() && id.name.is_empty())
                {
                    return Err(Error::filter(self.name(), format!("empty id '{id}'")));
                }
                ids.is_empty()
            }
            Self::Labels(selectors) | Self::Ignore(selectors) => selectors.is_empty(),
            Self::Nodes(nodes) => {
                if nodes.iter().any(|n| n.is_empty()) {
                    return Err(Error::filter(self.name(), "empty node name"));
                }
                nodes.is_empty()
            }
            Self::Owners(_) => false,
        };

        if empty {
            return Err(Error::filter(self.name(), "no values given"));
        }
        Ok(())
    }

    fn accepts<K: Selectable>(&self, id: &ResourceId, obj: &K) -> bool {
        match self {
            Self::Ids { ids, .. } => ids.iter().any(|want| want.matches(id)),
            Self::Labels(selectors) => selectors.iter().all(|s| s.matches(obj.labels())),
            Self::Ignore(selectors) => !selectors.iter().any(|s| s.matches(obj.labels())),
            Self::Nodes(nodes) => obj.node_name().is_some_and(|n| nodes.contains(n)),
            Self::Owners(membership) => membership.matches(id, obj.labels()),
        }
    }
}

/// Ordered conjunction of stages
///
/// The null filter accepts everything.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    stages: Vec<Stage>,
}

impl Filter {
    pub fn null() -> Self {
        Self::default()
    }

    /// Compose one more stage onto this filter
    pub fn and(mut self, stage: Stage) -> Result<Self> {
        stage.validate()?;
        self.stages.push(stage);
        Ok(self)
    }

    pub fn accepts<K: Selectable>(&self, obj: &K) -> bool {
        let id = resource_id(obj);
        self.stages.iter().all(|s| s.accepts(&id, obj))
    }
}
