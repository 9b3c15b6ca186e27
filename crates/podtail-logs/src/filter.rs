use std::collections::{BTreeSet, HashSet};

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use podtail_k8s::resource_id;
use podtail_types::EventSource;

/// Decides which containers of a pod warrant a log monitor
///
/// A container qualifies once it is running or has terminated, so that the
/// output of short-lived containers is still collected. An optional name
/// allow-list narrows the set further.
#[derive(Clone, Debug, Default)]
pub struct ContainerFilter {
    names: HashSet<String>,
}

impl ContainerFilter {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    /// Accept every container that has started
    pub fn all() -> Self {
        Self::default()
    }

    pub fn accept(&self, status: &ContainerStatus) -> bool {
        if !self.names.is_empty() && !self.names.contains(&status.name) {
            return false;
        }
        status
            .state
            .as_ref()
            .is_some_and(|s| s.running.is_some() || s.terminated.is_some())
    }

    /// Log sources for the accepted containers of `pod`, regular and init
    pub fn sources(&self, pod: &Pod) -> BTreeSet<EventSource> {
        let id = resource_id(pod);
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();

        let Some(status) = pod.status.as_ref() else {
            return BTreeSet::new();
        };

        status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten())
            .filter(|cs| self.accept(cs))
            .map(|cs| EventSource::new(id.clone(), cs.name.clone(), node.clone()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        PodSpec, PodStatus,
    };
    use kube::api::ObjectMeta;

    pub(crate) fn running(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn waiting(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn terminated(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn pod_with(
        ns: &str,
        name: &str,
        init: Vec<ContainerStatus>,
        containers: Vec<ContainerStatus>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                init_container_statuses: Some(init),
                container_statuses: Some(containers),
                ..Default::default()
            }),
        }
    }

    fn containers(sources: BTreeSet<EventSource>) -> Vec<String> {
        sources.into_iter().map(|s| s.container).collect()
    }

    #[test]
    fn test_running_and_terminated_accepted() {
        let filter = ContainerFilter::all();
        assert!(filter.accept(&running("app")));
        assert!(filter.accept(&terminated("job")));
        assert!(!filter.accept(&waiting("app")));
        assert!(!filter.accept(&ContainerStatus::default()));
    }

    #[test]
    fn test_sources_include_init_containers() {
        let pod = pod_with(
            "default",
            "web-1",
            vec![terminated("migrate")],
            vec![running("app"), waiting("sidecar")],
        );
        let sources = ContainerFilter::all().sources(&pod);
        assert_eq!(containers(sources.clone()), vec!["app", "migrate"]);

        let source = sources.first().unwrap();
        assert_eq!(source.namespace(), "default");
        assert_eq!(source.name(), "web-1");
        assert_eq!(source.node(), "node-1");
    }

    #[test]
    fn test_name_allow_list() {
        let pod = pod_with("default", "web-1", vec![], vec![running("app"), running("proxy")]);
        let filter = ContainerFilter::new(["proxy".to_string()]);
        assert_eq!(containers(filter.sources(&pod)), vec!["proxy"]);
    }

    #[test]
    fn test_pod_without_status() {
        let pod = Pod::default();
        assert!(ContainerFilter::all().sources(&pod).is_empty());
    }
}
