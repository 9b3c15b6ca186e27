//! Monitor reconciliation
//!
//! The controller keeps exactly one monitor per followed container. It
//! consumes the datastore's pod events on a single task, which is the only
//! place the monitor table is touched.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use podtail_k8s::{CacheEvent, Subscription, resource_id};
use podtail_types::{Event, EventSource, ResourceId};

use crate::filter::ContainerFilter;
use crate::monitor::{self, Monitor, MonitorConfig};
use crate::source::LogSource;

/// Default capacity of the output event queue
pub const DEFAULT_BUFFER: usize = 500;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Capacity of the output queue; lines beyond it are dropped
    pub buffer: usize,
    pub containers: ContainerFilter,
    pub monitor: MonitorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
            containers: ContainerFilter::all(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Handle to the reconciliation task
pub struct Controller {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Controller {
    /// Start reconciling `pods` and return the output event queue
    ///
    /// The queue ends once the controller and all of its monitors are done.
    /// Cancelling `cancel` stops the controller.
    pub fn spawn<L: LogSource>(
        pods: Subscription<Pod>,
        logs: L,
        config: ControllerConfig,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(config.buffer.max(1));
        let (completions, completed) = mpsc::unbounded_channel();
        let shutdown = cancel.child_token();
        let tracker = TaskTracker::new();

        let control = ControlLoop {
            logs,
            containers: config.containers,
            config: Arc::new(config.monitor),
            events,
            completions,
            monitors: HashMap::new(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            draining: false,
        };
        tracker.spawn(control.run(pods, completed));
        tracker.close();

        (Self { shutdown, tracker }, rx)
    }

    /// Ask the controller to stop every monitor and exit
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the controller and every monitor have finished
    pub async fn done(&self) {
        self.tracker.wait().await;
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    stopping: bool,
    /// Start a new monitor once this one completes
    restart: bool,
}

impl MonitorHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            stopping: false,
            restart: false,
        }
    }

    fn stop(&mut self) {
        self.restart = false;
        if !self.stopping {
            self.stopping = true;
            self.cancel.cancel();
        }
    }
}

type PodMonitors = HashMap<EventSource, MonitorHandle>;

struct ControlLoop<L> {
    logs: L,
    containers: ContainerFilter,
    config: Arc<MonitorConfig>,
    events: mpsc::Sender<Event>,
    completions: mpsc::UnboundedSender<EventSource>,
    /// An entry lives until its monitor's completion arrives, even after
    /// it was asked to stop
    monitors: HashMap<ResourceId, PodMonitors>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    draining: bool,
}

impl<L: LogSource> ControlLoop<L> {
    async fn run(
        mut self,
        pods: Subscription<Pod>,
        mut completed: mpsc::UnboundedReceiver<EventSource>,
    ) {
        let Subscription {
            initial,
            events: mut pod_events,
        } = pods;

        for pod in &initial {
            self.ensure_monitors(pod);
        }
        tracing::debug!(pods = initial.len(), "controller started");

        loop {
            if self.draining && self.monitors.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled(), if !self.draining => self.drain(),

                Some(source) = completed.recv() => self.completed(source),

                event = pod_events.recv(), if !self.draining => match event {
                    Some(event) => self.handle(event),
                    None => {
                        tracing::warn!("pod watch closed, stopping");
                        self.shutdown.cancel();
                    }
                },
            }
        }

        tracing::debug!("controller stopped");
    }

    fn handle(&mut self, event: CacheEvent<Pod>) {
        let pod = event.resource();
        let id = resource_id(pod.as_ref());
        tracing::debug!(event = event.as_str(), pod = %id, "pod event");

        match event {
            CacheEvent::Delete(_) => {
                if let Some(monitors) = self.monitors.get_mut(&id) {
                    monitors.values_mut().for_each(MonitorHandle::stop);
                }
            }
            CacheEvent::Add(pod) | CacheEvent::Update(pod) => self.ensure_monitors(&pod),
        }
    }

    /// Start monitors for newly ready containers and stop the rest
    fn ensure_monitors(&mut self, pod: &Pod) {
        let id = resource_id(pod);
        let wanted = self.containers.sources(pod);
        let mut missing = Vec::new();

        let monitors = self.monitors.entry(id.clone()).or_default();
        for (source, handle) in monitors.iter_mut() {
            if !wanted.contains(source) {
                handle.stop();
            }
        }
        for source in wanted {
            match monitors.get_mut(&source) {
                // Ready again before the old monitor finished
                Some(handle) if handle.stopping => handle.restart = true,
                Some(_) => {}
                None => missing.push(source),
            }
        }

        for source in missing {
            let handle = self.start(source.clone());
            self.monitors.entry(id.clone()).or_default().insert(source, handle);
        }
        if self.monitors.get(&id).is_some_and(HashMap::is_empty) {
            self.monitors.remove(&id);
        }
    }

    fn start(&self, source: EventSource) -> MonitorHandle {
        tracing::debug!(source = %source, "starting monitor");
        let cancel = self.shutdown.child_token();
        let monitor = Monitor::new(
            source,
            self.logs.clone(),
            self.events.clone(),
            Arc::clone(&self.config),
        );
        monitor::spawn(monitor, cancel.clone(), self.completions.clone(), &self.tracker);
        MonitorHandle::new(cancel)
    }

    fn completed(&mut self, source: EventSource) {
        let Some(monitors) = self.monitors.get_mut(&source.id) else {
            return;
        };
        let Some(handle) = monitors.remove(&source) else {
            return;
        };

        if handle.restart && !self.draining {
            let handle = self.start(source.clone());
            if let Some(monitors) = self.monitors.get_mut(&source.id) {
                monitors.insert(source.clone(), handle);
            }
        } else if !handle.stopping {
            tracing::debug!(source = %source, "monitor exited");
        }

        if self.monitors.get(&source.id).is_some_and(HashMap::is_empty) {
            self.monitors.remove(&source.id);
        }
    }

    fn drain(&mut self) {
        let count: usize = self.monitors.values().map(HashMap::len).sum();
        tracing::debug!(monitors = count, "draining");
        self.draining = true;
        self.monitors
            .values_mut()
            .flat_map(HashMap::values_mut)
            .for_each(MonitorHandle::stop);
    }
}
