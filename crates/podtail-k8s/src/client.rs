use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::runtime::{WatchStreamExt, watcher};

use crate::error::{Error, Result};
use crate::source::{WatchSource, WatchStream, WatchedResource};

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Connect to the cluster of a kubeconfig context, or the inferred
    /// config (in-cluster or current context) when none is given
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(name) => {
                kube::Config::from_kubeconfig(&KubeConfigOptions {
                    context: Some(name.to_string()),
                    ..Default::default()
                })
                .await?
            }
            None => kube::Config::infer().await?,
        };

        let this = Self {
            client: kube::Client::try_from(config)?,
        };

        this.validate().await?;
        Ok(this)
    }

    /// Validate that the client can make API calls
    async fn validate(&self) -> Result<()> {
        let ns: Api<Namespace> = Api::all(self.client.clone());
        ns.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

impl WatchSource for KubeClient {
    async fn watch<K: WatchedResource>(&self, namespace: Option<&str>) -> Result<WatchStream<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        // The watcher itself connects lazily; list once so that missing
        // permissions or an unknown kind fail construction instead.
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(|source| Error::Watch {
                kind: K::kind(&()).to_string(),
                source,
            })?;

        Ok(watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed())
    }
}
