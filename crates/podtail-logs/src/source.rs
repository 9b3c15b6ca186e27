use std::future::Future;
use std::io;
use std::pin::Pin;

use futures::AsyncRead;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;

use podtail_k8s::KubeClient;
use podtail_types::EventSource;

/// Live byte stream of one container's log
pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Options for opening a follow-mode log stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Only return lines newer than this many seconds
    pub since_seconds: Option<i64>,
    /// Prefix every line with its RFC3339 timestamp
    pub timestamps: bool,
}

/// Something that can open container log streams
pub trait LogSource: Clone + Send + Sync + 'static {
    fn open(
        &self,
        source: &EventSource,
        options: LogOptions,
    ) -> impl Future<Output = io::Result<LogReader>> + Send;
}

impl LogSource for KubeClient {
    async fn open(&self, source: &EventSource, options: LogOptions) -> io::Result<LogReader> {
        let api: Api<Pod> = Api::namespaced(self.client().clone(), source.namespace());
        let params = LogParams {
            follow: true,
            container: Some(source.container().to_string()),
            since_seconds: options.since_seconds,
            timestamps: options.timestamps,
            ..Default::default()
        };

        let stream = api
            .log_stream(source.name(), &params)
            .await
            .map_err(io::Error::other)?;
        Ok(Box::pin(stream))
    }
}
