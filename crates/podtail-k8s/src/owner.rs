//! Owner resources and pod membership derivation
//!
//! Services, replication controllers, replica sets, daemon sets and
//! deployments select pods by label. When the user filters on one of them,
//! the set of matching owners is cached and its pod selectors are folded
//! into an [`OwnerMembership`], which the pod filter consults.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ReplicationController, Service};
use kube::ResourceExt;

use crate::cache::{ObjectCache, Refilter};
use crate::filter::{OwnerMembership, OwnerSelector, Selectable};
use crate::selector::LabelSelector;

/// A resource kind whose objects select pods
pub trait Owner: Selectable {
    /// Short name used in logs and filter errors
    const KIND: &'static str;

    /// Pod selector of this object; `None` when it has none or it is empty,
    /// in which case the object selects no pods.
    fn pod_selector(&self) -> Option<LabelSelector>;
}

fn non_empty(selector: LabelSelector) -> Option<LabelSelector> {
    (!selector.is_empty()).then_some(selector)
}

fn from_api(
    selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
    kind: &str,
    name: &str,
) -> Option<LabelSelector> {
    match LabelSelector::try_from(selector) {
        Ok(selector) => non_empty(selector),
        Err(e) => {
            tracing::warn!(kind, name, error = %e, "ignoring owner with unusable selector");
            None
        }
    }
}

impl Selectable for Service {}
impl Selectable for ReplicationController {}
impl Selectable for ReplicaSet {}
impl Selectable for DaemonSet {}
impl Selectable for Deployment {}

impl Owner for Service {
    const KIND: &'static str = "service";

    fn pod_selector(&self) -> Option<LabelSelector> {
        let map = self.spec.as_ref()?.selector.as_ref()?;
        non_empty(LabelSelector::from(map))
    }
}

impl Owner for ReplicationController {
    const KIND: &'static str = "rc";

    fn pod_selector(&self) -> Option<LabelSelector> {
        let map = self.spec.as_ref()?.selector.as_ref()?;
        non_empty(LabelSelector::from(map))
    }
}

impl Owner for ReplicaSet {
    const KIND: &'static str = "rs";

    fn pod_selector(&self) -> Option<LabelSelector> {
        from_api(&self.spec.as_ref()?.selector, Self::KIND, &self.name_any())
    }
}

impl Owner for DaemonSet {
    const KIND: &'static str = "ds";

    fn pod_selector(&self) -> Option<LabelSelector> {
        from_api(&self.spec.as_ref()?.selector, Self::KIND, &self.name_any())
    }
}

impl Owner for Deployment {
    const KIND: &'static str = "deployment";

    fn pod_selector(&self) -> Option<LabelSelector> {
        from_api(&self.spec.as_ref()?.selector, Self::KIND, &self.name_any())
    }
}

/// Selectors of every owner that has one
pub fn owner_selectors<K: Owner>(owners: &[Arc<K>]) -> Vec<OwnerSelector> {
    owners
        .iter()
        .filter_map(|owner| {
            Some(OwnerSelector {
                namespace: owner.namespace().unwrap_or_default(),
                selector: owner.pod_selector()?,
            })
        })
        .collect()
}

/// Keep `membership` in sync with the owners visible in `owners`
///
/// Each change is followed by a refilter of the pod cache, so that pods
/// entering or leaving the selection are published as adds or deletes.
/// Returns when the owner cache closes.
pub(crate) async fn track_owners<K: Owner>(
    owners: ObjectCache<K>,
    membership: OwnerMembership,
    refilter: Refilter,
) {
    if !owners.ready().await {
        tracing::debug!(kind = K::KIND, "owner cache closed before ready");
        return;
    }

    let mut sub = owners.subscribe();
    let current = owner_selectors(&sub.initial);
    tracing::debug!(kind = K::KIND, owners = current.len(), "initial owners");
    membership.replace(current);
    refilter.request().await;
    membership.mark_initialized();

    while let Some(event) = sub.events.recv().await {
        tracing::debug!(
            kind = K::KIND,
            event = event.as_str(),
            name = %event.resource().name_any(),
            "owner changed"
        );
        membership.replace(owner_selectors(&owners.list()));
        refilter.request().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::ReplicaSetSpec;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as ApiLabelSelector;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn service(ns: &str, name: &str, selector: Option<&[(&str, &str)]>) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: selector.map(|pairs| {
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_selector() {
        let svc = service("default", "web", Some(&[("app", "web")]));
        let sel = svc.pod_selector().unwrap();
        assert!(sel.matches(&BTreeMap::from([("app".to_string(), "web".to_string())])));
    }

    #[test]
    fn test_empty_selector_selects_nothing() {
        assert!(service("default", "a", None).pod_selector().is_none());
        assert!(service("default", "b", Some(&[])).pod_selector().is_none());

        let rs = ReplicaSet {
            spec: Some(ReplicaSetSpec {
                selector: ApiLabelSelector::default(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(rs.pod_selector().is_none());
    }

    #[test]
    fn test_owner_selectors_skip_selectorless() {
        let owners = vec![
            Arc::new(service("a", "web", Some(&[("app", "web")]))),
            Arc::new(service("a", "headless", None)),
            Arc::new(service("b", "db", Some(&[("app", "db")]))),
        ];
        let selectors = owner_selectors(&owners);
        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0].namespace, "a");
        assert_eq!(selectors[1].namespace, "b");
    }
}
