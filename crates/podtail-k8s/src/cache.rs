//! Watched object caches
//!
//! An [`ObjectCache`] consumes a watch stream for one resource kind, keeps
//! every object it has seen, and publishes the subset accepted by its
//! [`Filter`] as add/update/delete events. Changing the outcome of the
//! filter (owner membership changes) is applied with [`Refilter`], which
//! re-evaluates every known object and emits the resulting adds/deletes.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::ResourceExt;
use kube::runtime::watcher;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use podtail_types::ResourceId;

use crate::filter::{Filter, Selectable, resource_id};
use crate::source::WatchStream;

/// A change to the filtered view of a cache
#[derive(Clone, Debug)]
pub enum CacheEvent<K> {
    Add(Arc<K>),
    Update(Arc<K>),
    Delete(Arc<K>),
}

impl<K> CacheEvent<K> {
    pub fn resource(&self) -> &Arc<K> {
        match self {
            Self::Add(k) | Self::Update(k) | Self::Delete(k) => k,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// Snapshot of the filtered view plus every change after it
///
/// `events` ends when the cache shuts down.
pub struct Subscription<K> {
    pub initial: Vec<Arc<K>>,
    pub events: mpsc::UnboundedReceiver<CacheEvent<K>>,
}

impl<K> Subscription<K> {
    pub fn new(initial: Vec<Arc<K>>, events: mpsc::UnboundedReceiver<CacheEvent<K>>) -> Self {
        Self { initial, events }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Status {
    ready: bool,
    closed: bool,
}

struct Subscribers<K> {
    senders: Vec<mpsc::UnboundedSender<CacheEvent<K>>>,
    closed: bool,
}

/// State readable from cache handles
struct Shared<K> {
    visible: RwLock<BTreeMap<ResourceId, Arc<K>>>,
    subscribers: Mutex<Subscribers<K>>,
    status: watch::Sender<Status>,
}

/// Request to re-evaluate a cache's filter; acknowledged once applied
type RefilterRequest = oneshot::Sender<()>;

/// Receiving half of a [`Refilter`] handle, consumed by the cache task
pub struct RefilterRequests(mpsc::UnboundedReceiver<RefilterRequest>);

/// Handle used to make a cache re-evaluate its filter
#[derive(Clone)]
pub struct Refilter {
    tx: mpsc::UnboundedSender<RefilterRequest>,
}

impl Refilter {
    pub fn channel() -> (Self, RefilterRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, RefilterRequests(rx))
    }

    /// Ask the cache to re-evaluate its filter and wait until it has.
    /// Returns immediately if the cache is gone.
    pub async fn request(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ack).is_ok() {
            let _ = done.await;
        }
    }
}

/// Handle to a running cache task
pub struct ObjectCache<K> {
    kind: String,
    shared: Arc<Shared<K>>,
    refilter: Refilter,
    cancel: CancellationToken,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            shared: Arc::clone(&self.shared),
            refilter: self.refilter.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<K: Selectable> ObjectCache<K> {
    /// Spawn a cache over `stream`, publishing the objects `filter` accepts
    pub fn spawn(
        stream: WatchStream<K>,
        filter: Filter,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (refilter, requests) = Refilter::channel();
        Self::spawn_with(stream, filter, refilter, requests, cancel, tracker)
    }

    /// Like [`ObjectCache::spawn`], with a refilter channel created up front so
    /// that other tasks can hold the handle before the cache exists
    pub fn spawn_with(
        stream: WatchStream<K>,
        filter: Filter,
        refilter: Refilter,
        requests: RefilterRequests,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let kind = K::kind(&()).to_string();
        let (status, _) = watch::channel(Status::default());
        let shared = Arc::new(Shared {
            visible: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                closed: false,
            }),
            status,
        });

        let task = CacheTask {
            kind: kind.clone(),
            filter,
            all: BTreeMap::new(),
            pending: None,
            shared: Arc::clone(&shared),
        };

        let span = tracing::debug_span!("cache", kind = %kind);
        tracker.spawn(
            task.run(stream, requests.0, cancel.clone())
                .instrument(span),
        );

        Self {
            kind,
            shared,
            refilter,
            cancel,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Objects currently accepted by the filter, ordered by id
    pub fn list(&self) -> Vec<Arc<K>> {
        self.shared.visible.read().values().cloned().collect()
    }

    /// Take a snapshot and subscribe to every later change, atomically
    pub fn subscribe(&self) -> Subscription<K> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.lock();
        let initial = self.shared.visible.read().values().cloned().collect();
        // A closed cache drops the sender right away so the receiver ends.
        if !subscribers.closed {
            subscribers.senders.push(tx);
        }
        Subscription::new(initial, rx)
    }

    pub fn refilter(&self) -> &Refilter {
        &self.refilter
    }

    /// Type-erased ready/closed signals of this cache
    pub fn signals(&self) -> CacheSignals {
        CacheSignals {
            kind: self.kind.clone(),
            status: self.shared.status.subscribe(),
        }
    }

    /// Wait for the initial listing. Returns false if the cache shut down first.
    pub async fn ready(&self) -> bool {
        self.signals().ready().await
    }

    pub fn is_ready(&self) -> bool {
        self.shared.status.borrow().ready
    }

    /// Wait until the cache task has exited
    pub async fn done(&self) {
        self.signals().done().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.status.borrow().closed
    }

    /// Stop the cache task; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Ready/closed state of a cache, independent of the object type it holds
#[derive(Clone)]
pub struct CacheSignals {
    kind: String,
    status: watch::Receiver<Status>,
}

impl CacheSignals {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the initial listing. Returns false if the cache shut down first.
    pub async fn ready(&self) -> bool {
        let mut rx = self.status.clone();
        match rx.wait_for(|s| s.ready || s.closed).await {
            Ok(status) => status.ready,
            Err(_) => false,
        }
    }

    /// Wait until the cache task has exited
    pub async fn done(&self) {
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|s| s.closed).await;
    }
}

struct CacheTask<K> {
    kind: String,
    filter: Filter,
    /// Every object seen, regardless of the filter
    all: BTreeMap<ResourceId, Arc<K>>,
    /// Objects collected during a (re)list, swapped in on `InitDone`
    pending: Option<BTreeMap<ResourceId, Arc<K>>>,
    shared: Arc<Shared<K>>,
}

impl<K: Selectable> CacheTask<K> {
    async fn run(
        mut self,
        mut stream: WatchStream<K>,
        mut requests: mpsc::UnboundedReceiver<RefilterRequest>,
        cancel: CancellationToken,
    ) {
        tracing::debug!("cache started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(ack) = requests.recv() => {
                    self.refilter();
                    let _ = ack.send(());
                }

                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        tracing::warn!(kind = %self.kind, error = %e, "watch error");
                    }
                    None => {
                        tracing::warn!(kind = %self.kind, "watch stream ended");
                        break;
                    }
                },
            }
        }

        // Dropping the senders ends every subscription.
        {
            let mut subscribers = self.shared.subscribers.lock();
            subscribers.closed = true;
            subscribers.senders.clear();
        }
        self.shared.status.send_modify(|s| s.closed = true);
        tracing::debug!("cache closed");
    }

    fn apply(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                self.pending = Some(BTreeMap::new());
            }
            watcher::Event::InitApply(obj) => {
                let obj = Arc::new(obj);
                self.pending
                    .get_or_insert_with(BTreeMap::new)
                    .insert(resource_id(obj.as_ref()), obj);
            }
            watcher::Event::InitDone => {
                let fresh = self.pending.take().unwrap_or_default();
                let gone: Vec<ResourceId> = self
                    .all
                    .keys()
                    .filter(|id| !fresh.contains_key(*id))
                    .cloned()
                    .collect();
                for id in gone {
                    self.remove(&id);
                }
                for (_, obj) in fresh {
                    self.upsert(obj);
                }
                self.shared.status.send_if_modified(|s| {
                    let changed = !s.ready;
                    s.ready = true;
                    changed
                });
            }
            watcher::Event::Apply(obj) => self.upsert(Arc::new(obj)),
            watcher::Event::Delete(obj) => self.remove(&resource_id(&obj)),
        }
    }

    fn upsert(&mut self, obj: Arc<K>) {
        let id = resource_id(obj.as_ref());
        let previous = self.all.insert(id.clone(), Arc::clone(&obj));
        let accepted = self.filter.accepts(obj.as_ref());
        let visible = self.shared.visible.read().contains_key(&id);

        match (visible, accepted) {
            (false, true) => self.publish(id, CacheEvent::Add(obj)),
            (true, true) => {
                let unchanged = previous.as_ref().is_some_and(|prev| {
                    prev.resource_version().is_some()
                        && prev.resource_version() == obj.resource_version()
                });
                if !unchanged {
                    self.publish(id, CacheEvent::Update(obj));
                }
            }
            (true, false) => self.publish(id, CacheEvent::Delete(obj)),
            (false, false) => {}
        }
    }

    fn remove(&mut self, id: &ResourceId) {
        if let Some(obj) = self.all.remove(id) {
            if self.shared.visible.read().contains_key(id) {
                self.publish(id.clone(), CacheEvent::Delete(obj));
            }
        }
    }

    fn refilter(&mut self) {
        let mut changes = Vec::new();
        {
            let visible = self.shared.visible.read();
            for (id, obj) in &self.all {
                match (visible.contains_key(id), self.filter.accepts(obj.as_ref())) {
                    (false, true) => changes.push((id.clone(), CacheEvent::Add(Arc::clone(obj)))),
                    (true, false) => {
                        changes.push((id.clone(), CacheEvent::Delete(Arc::clone(obj))))
                    }
                    _ => {}
                }
            }
        }

        tracing::debug!(kind = %self.kind, changes = changes.len(), "refiltered");
        for (id, event) in changes {
            self.publish(id, event);
        }
    }

    /// Update the visible view and notify subscribers under one lock, so a
    /// concurrent `subscribe` sees either the old view and the event, or the
    /// new view and no event.
    fn publish(&self, id: ResourceId, event: CacheEvent<K>) {
        let mut subscribers = self.shared.subscribers.lock();
        {
            let mut visible = self.shared.visible.write();
            match &event {
                CacheEvent::Add(obj) | CacheEvent::Update(obj) => {
                    visible.insert(id, Arc::clone(obj));
                }
                CacheEvent::Delete(_) => {
                    visible.remove(&id);
                }
            }
        }
        subscribers
            .senders
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
