//! Filtered pod datastore
//!
//! The [`Datastore`] owns the pod cache and every owner cache it needs.
//! It is assembled with a [`DatastoreBuilder`] and created in one fallible
//! step; on failure every cache opened so far is closed before the error is
//! returned.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, ReplicationController, Service};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use podtail_types::ResourceId;

use crate::cache::{CacheSignals, ObjectCache, Refilter};
use crate::error::Result;
use crate::filter::{Filter, OwnerMembership, Stage};
use crate::owner::{Owner, track_owners};
use crate::selector::LabelSelector;
use crate::source::WatchSource;

/// Selection criteria for the pods to follow
///
/// Every field left empty is not applied. Owner ids with an empty namespace
/// match owners in any namespace.
#[derive(Clone, Debug, Default)]
pub struct DatastoreBuilder {
    namespaces: BTreeSet<String>,
    pods: Vec<ResourceId>,
    labels: Vec<LabelSelector>,
    ignore: Vec<LabelSelector>,
    nodes: BTreeSet<String>,
    services: Vec<ResourceId>,
    rcs: Vec<ResourceId>,
    rss: Vec<ResourceId>,
    dss: Vec<ResourceId>,
    deployments: Vec<ResourceId>,
}

impl DatastoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn with_pods(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.pods.extend(ids);
        self
    }

    pub fn with_labels(mut self, selectors: impl IntoIterator<Item = LabelSelector>) -> Self {
        self.labels.extend(selectors);
        self
    }

    pub fn with_ignore(mut self, selectors: impl IntoIterator<Item = LabelSelector>) -> Self {
        self.ignore.extend(selectors);
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn with_services(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.services.extend(ids);
        self
    }

    pub fn with_rcs(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.rcs.extend(ids);
        self
    }

    pub fn with_rss(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.rss.extend(ids);
        self
    }

    pub fn with_dss(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.dss.extend(ids);
        self
    }

    pub fn with_deployments(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.deployments.extend(ids);
        self
    }

    /// Namespace to scope watches to, when exactly one is selected
    fn scope(&self) -> Option<&str> {
        match self.namespaces.len() {
            1 => self.namespaces.iter().next().map(String::as_str),
            _ => None,
        }
    }

    fn static_filter(&self) -> Result<Filter> {
        let mut filter = Filter::null();
        if !self.namespaces.is_empty() {
            filter = filter.and(Stage::Ids {
                name: "namespace",
                ids: self.namespaces.iter().map(ResourceId::namespace).collect(),
            })?;
        }
        if !self.pods.is_empty() {
            filter = filter.and(Stage::Ids {
                name: "pod",
                ids: self.pods.clone(),
            })?;
        }
        if !self.labels.is_empty() {
            filter = filter.and(Stage::Labels(self.labels.clone()))?;
        }
        if !self.ignore.is_empty() {
            filter = filter.and(Stage::Ignore(self.ignore.clone()))?;
        }
        if !self.nodes.is_empty() {
            filter = filter.and(Stage::Nodes(self.nodes.clone()))?;
        }
        Ok(filter)
    }

    /// Open every watch and spawn the caches
    ///
    /// The returned datastore is not ready yet; wait on [`Datastore::ready`].
    /// Cancelling `cancel` shuts the datastore down.
    pub async fn create<W: WatchSource>(
        self,
        source: &W,
        cancel: &CancellationToken,
    ) -> Result<Datastore> {
        let cancel = cancel.child_token();
        let tracker = TaskTracker::new();

        let result = self.build(source, &cancel, &tracker).await;
        tracker.close();

        match result {
            Ok(parts) => Ok(Datastore {
                pods: parts.pods,
                caches: parts.caches,
                memberships: parts.memberships,
                cancel,
                tracker,
            }),
            Err(e) => {
                cancel.cancel();
                tracker.wait().await;
                Err(e)
            }
        }
    }

    async fn build<W: WatchSource>(
        &self,
        source: &W,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Parts> {
        let scope = self.scope();
        let pod_stream = source.watch::<Pod>(scope).await?;
        let mut filter = self.static_filter()?;

        let (refilter, requests) = Refilter::channel();
        let mut owners = Owners {
            source,
            scope,
            refilter: &refilter,
            cancel,
            tracker,
            caches: Vec::new(),
            memberships: Vec::new(),
        };
        owners.add::<Service>(&self.services).await?;
        owners.add::<ReplicationController>(&self.rcs).await?;
        owners.add::<ReplicaSet>(&self.rss).await?;
        owners.add::<DaemonSet>(&self.dss).await?;
        owners.add::<Deployment>(&self.deployments).await?;

        let Owners {
            mut caches,
            memberships,
            ..
        } = owners;
        for membership in &memberships {
            filter = filter.and(Stage::Owners(membership.clone()))?;
        }

        let pods = ObjectCache::spawn_with(
            pod_stream,
            filter,
            refilter,
            requests,
            cancel.child_token(),
            tracker,
        );
        caches.insert(0, pods.signals());

        tracing::debug!(
            scope = scope.unwrap_or("<all>"),
            owners = memberships.len(),
            "datastore created"
        );

        Ok(Parts {
            pods,
            caches,
            memberships,
        })
    }
}

struct Parts {
    pods: ObjectCache<Pod>,
    caches: Vec<CacheSignals>,
    memberships: Vec<OwnerMembership>,
}

/// Owner caches opened so far during construction
struct Owners<'a, W> {
    source: &'a W,
    scope: Option<&'a str>,
    refilter: &'a Refilter,
    cancel: &'a CancellationToken,
    tracker: &'a TaskTracker,
    caches: Vec<CacheSignals>,
    memberships: Vec<OwnerMembership>,
}

impl<W: WatchSource> Owners<'_, W> {
    async fn add<K: Owner>(&mut self, ids: &[ResourceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let filter = Filter::null().and(Stage::Ids {
            name: K::KIND,
            ids: ids.to_vec(),
        })?;
        let stream = self.source.watch::<K>(self.scope).await?;
        let cache = ObjectCache::<K>::spawn(stream, filter, self.cancel.child_token(), self.tracker);

        let membership = OwnerMembership::new(K::KIND);
        self.tracker.spawn(
            track_owners(cache.clone(), membership.clone(), self.refilter.clone())
                .instrument(tracing::debug_span!("owners", kind = K::KIND)),
        );

        self.caches.push(cache.signals());
        self.memberships.push(membership);
        Ok(())
    }
}

/// Live, filtered view of the pods to follow
pub struct Datastore {
    pods: ObjectCache<Pod>,
    caches: Vec<CacheSignals>,
    memberships: Vec<OwnerMembership>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Datastore {
    pub fn builder() -> DatastoreBuilder {
        DatastoreBuilder::new()
    }

    /// The filtered pod cache
    pub fn pods(&self) -> &ObjectCache<Pod> {
        &self.pods
    }

    /// Wait until every cache has its initial listing and every owner
    /// membership has been applied to the pod view. Returns false if the
    /// datastore shut down first.
    pub async fn ready(&self) -> bool {
        for cache in &self.caches {
            if !cache.ready().await {
                tracing::debug!(kind = cache.kind(), "cache closed before ready");
                return false;
            }
        }
        for membership in &self.memberships {
            tokio::select! {
                _ = membership.initialized() => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
        true
    }

    /// Close every cache; idempotent
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until every cache and owner task has exited
    pub async fn done(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::ResourceExt;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use parking_lot::Mutex;

    use crate::cache::tests::{Feed, feed, initial, next, pod};
    use crate::error::Error;
    use crate::source::{WatchStream, WatchedResource};

    /// In-memory cluster handing out one prepared stream per kind
    #[derive(Clone, Default)]
    struct FakeWatchSource {
        streams: Arc<Mutex<HashMap<String, Box<dyn Any + Send>>>>,
        failing: Arc<Mutex<HashSet<String>>>,
        opened: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    impl FakeWatchSource {
        fn feed<K: WatchedResource>(&self) -> Feed<K> {
            let (tx, stream) = feed::<K>();
            self.streams
                .lock()
                .insert(K::kind(&()).to_string(), Box::new(stream));
            tx
        }

        fn fail<K: WatchedResource>(&self) {
            self.failing.lock().insert(K::kind(&()).to_string());
        }
    }

    impl WatchSource for FakeWatchSource {
        async fn watch<K: WatchedResource>(
            &self,
            namespace: Option<&str>,
        ) -> Result<WatchStream<K>> {
            let kind = K::kind(&()).to_string();
            self.opened
                .lock()
                .push((kind.clone(), namespace.map(str::to_string)));

            if self.failing.lock().contains(&kind) {
                return Err(Error::Watch {
                    kind,
                    source: kube::Error::Api(ErrorResponse {
                        status: "Failure".to_string(),
                        message: "forbidden".to_string(),
                        reason: "Forbidden".to_string(),
                        code: 403,
                    }),
                });
            }

            let stream = self.streams.lock().remove(&kind);
            Ok(match stream.and_then(|s| s.downcast::<WatchStream<K>>().ok()) {
                Some(stream) => *stream,
                None => futures::stream::pending().boxed(),
            })
        }
    }

    fn service(ns: &str, name: &str, app: &str, version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some([("app".to_string(), app.to_string())].into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_names(ds: &Datastore) -> Vec<String> {
        ds.pods().list().iter().map(|p| p.name_any()).collect()
    }

    fn cluster_pods() -> Vec<Pod> {
        vec![
            pod("default", "web-1", &[("app", "web")], "1"),
            pod("default", "web-2", &[("app", "web"), ("podtail.ignore", "true")], "1"),
            pod("default", "db-1", &[("app", "db")], "1"),
            pod("other", "web-3", &[("app", "web")], "1"),
        ]
    }

    fn web_service_builder() -> DatastoreBuilder {
        Datastore::builder()
            .with_services([ResourceId::new("default", "web")])
            .with_ignore(["podtail.ignore=true".parse().unwrap()])
    }

    #[tokio::test]
    async fn test_static_filters() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let ds = Datastore::builder()
            .with_namespaces(["default"])
            .with_labels(["app=web".parse().unwrap()])
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();

        initial(&pods, cluster_pods());
        assert!(ds.ready().await);
        assert_eq!(pod_names(&ds), vec!["web-1", "web-2"]);
        // A single namespace scopes the watch
        assert_eq!(
            source.opened.lock()[0],
            ("Pod".to_string(), Some("default".to_string()))
        );
    }

    #[tokio::test]
    async fn test_listing_order_does_not_change_result() {
        // Pods listed before owners
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let ds = web_service_builder()
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();
        initial(&pods, cluster_pods());
        assert!(ds.pods().ready().await);
        initial(&services, vec![service("default", "web", "web", "1")]);
        assert!(ds.ready().await);
        let first = pod_names(&ds);

        // Owners listed before pods
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let ds = web_service_builder()
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();
        initial(&services, vec![service("default", "web", "web", "1")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        initial(&pods, cluster_pods());
        assert!(ds.ready().await);

        assert_eq!(first, vec!["web-1"]);
        assert_eq!(pod_names(&ds), first);
    }

    #[tokio::test]
    async fn test_owner_change_rederives_pods() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let ds = web_service_builder()
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();
        initial(&pods, cluster_pods());
        initial(&services, vec![service("default", "web", "web", "1")]);
        assert!(ds.ready().await);

        let mut sub = ds.pods().subscribe();
        assert_eq!(sub.initial.len(), 1);

        // The service now selects the database pods instead
        services
            .unbounded_send(Ok(kube::runtime::watcher::Event::Apply(service(
                "default", "web", "db", "2",
            ))))
            .unwrap();

        let mut changes = vec![next(&mut sub).await, next(&mut sub).await];
        changes.sort_by_key(|ev| ev.resource().name_any());
        assert_eq!(changes[0].as_str(), "add");
        assert_eq!(changes[0].resource().name_any(), "db-1");
        assert!(changes[1].is_delete());
        assert_eq!(changes[1].resource().name_any(), "web-1");
        assert_eq!(pod_names(&ds), vec!["db-1"]);
    }

    #[tokio::test]
    async fn test_owner_narrowing_leaves_remaining_pods_alone() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let ds = web_service_builder()
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();
        initial(
            &pods,
            vec![
                pod("default", "web-1", &[("app", "web"), ("tier", "front")], "1"),
                pod("default", "web-4", &[("app", "web")], "1"),
            ],
        );
        initial(&services, vec![service("default", "web", "web", "1")]);
        assert!(ds.ready().await);

        let mut sub = ds.pods().subscribe();
        assert_eq!(sub.initial.len(), 2);

        let mut narrowed = service("default", "web", "web", "2");
        if let Some(spec) = narrowed.spec.as_mut() {
            spec.selector = Some(
                [
                    ("app".to_string(), "web".to_string()),
                    ("tier".to_string(), "front".to_string()),
                ]
                .into(),
            );
        }
        services
            .unbounded_send(Ok(kube::runtime::watcher::Event::Apply(narrowed)))
            .unwrap();

        let change = next(&mut sub).await;
        assert!(change.is_delete());
        assert_eq!(change.resource().name_any(), "web-4");

        // web-1 is still selected and sees no event at all
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.events.try_recv().is_err());
        assert_eq!(pod_names(&ds), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_unselected_owner_matches_nothing() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let ds = web_service_builder()
            .create(&source, &CancellationToken::new())
            .await
            .unwrap();
        initial(&pods, cluster_pods());
        // Only a service that is not among the requested ids exists
        initial(&services, vec![service("default", "api", "web", "1")]);
        assert!(ds.ready().await);
        assert!(pod_names(&ds).is_empty());
    }

    #[tokio::test]
    async fn test_failed_owner_watch_closes_opened_caches() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        source.fail::<ReplicaSet>();

        let result = web_service_builder()
            .with_rss([ResourceId::new("", "web-abc")])
            .create(&source, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Watch { .. })));
        assert!(pods.is_closed());
        assert!(services.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_filter_fails_creation() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();

        let result = Datastore::builder()
            .with_nodes([""])
            .create(&source, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::InvalidFilter { stage: "node", .. })));
        assert!(pods.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let source = FakeWatchSource::default();
        let pods = source.feed::<Pod>();
        let services = source.feed::<Service>();
        let cancel = CancellationToken::new();
        let ds = web_service_builder().create(&source, &cancel).await.unwrap();
        let mut sub = ds.pods().subscribe();

        cancel.cancel();
        ds.done().await;
        assert!(sub.events.recv().await.is_none());
        assert!(!ds.ready().await);
        assert!(pods.is_closed());
        assert!(services.is_closed());
    }
}
