use std::fmt::Debug;
use std::future::Future;

use futures::stream::BoxStream;
use kube::Resource;
use kube::core::NamespaceResourceScope;
use kube::runtime::watcher;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Raw watch events for one resource kind, as produced by `kube::runtime::watcher`
pub type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Bounds shared by every resource kind podtail watches
pub trait WatchedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> WatchedResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Something that can open a watch over a resource kind
///
/// The returned future resolves once the watch is known to be usable, so
/// that construction errors surface before any cache is spawned.
pub trait WatchSource: Clone + Send + Sync + 'static {
    fn watch<K: WatchedResource>(
        &self,
        namespace: Option<&str>,
    ) -> impl Future<Output = Result<WatchStream<K>>> + Send;
}
