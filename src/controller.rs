use crate::workqueue::{ItemExponentialBackoff, WorkQueue};
use futures::{Stream, StreamExt};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconciles one object of kind `K`. Errors are retried with backoff by the [`Controller`].
pub trait Syncer<K>: Send + Sync + 'static {
    fn sync(&self, obj: Arc<K>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub workers: usize,
    pub sync_timeout: Duration,
    pub backoff: ItemExponentialBackoff,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_timeout: Duration::from_secs(60),
            backoff: ItemExponentialBackoff::default(),
        }
    }
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Enqueues keys into a controller's work queue from outside of its event stream.
pub struct ControllerHandle<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    name: &'static str,
    queue: WorkQueue<ObjectRef<K>>,
    store: Store<K>,
}

impl<K> Clone for ControllerHandle<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            queue: self.queue.clone(),
            store: self.store.clone(),
        }
    }
}

impl<K> ControllerHandle<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, store: Store<K>, backoff: ItemExponentialBackoff) -> Self {
        Self {
            name,
            queue: WorkQueue::new(backoff),
            store,
        }
    }

    /// The local cache the keys are resolved against.
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Number of keys waiting to be processed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&self, key: ObjectRef<K>) {
        self.queue.add(key);
    }

    pub fn enqueue_event(&self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj)
            | watcher::Event::InitApply(obj)
            | watcher::Event::Delete(obj) => self.enqueue(ObjectRef::from_obj(obj)),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Enqueues every object in the local cache.
    pub fn resync(&self) {
        if self.queue.is_shutting_down() {
            return;
        }
        let objects = self.store.state();
        debug!(
            "Resyncing {} {} objects, {} keys pending",
            objects.len(),
            self.name,
            self.pending()
        );
        for obj in objects {
            self.enqueue(ObjectRef::from_obj(obj.as_ref()));
        }
    }
}

/// Drives a [`Syncer`] from a work queue of keys. Keys that no longer resolve in the local
/// cache are dropped, failed syncs are requeued with exponential backoff.
pub struct Controller<K, S>
where
    K: Resource<DynamicType = ()> + 'static,
{
    handle: ControllerHandle<K>,
    syncer: Arc<S>,
    settings: Settings,
}

impl<K, S> Controller<K, S>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    S: Syncer<K>,
{
    pub fn new(name: &'static str, store: Store<K>, syncer: S, settings: Settings) -> Self {
        Self {
            handle: ControllerHandle::new(name, store, settings.backoff),
            syncer: Arc::new(syncer),
            settings,
        }
    }

    pub fn name(&self) -> &'static str {
        self.handle.name
    }

    pub fn handle(&self) -> ControllerHandle<K> {
        self.handle.clone()
    }

    /// Processes keys until `shutdown` is cancelled, then waits for in-flight syncs to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting {} controller with {} workers",
            self.name(),
            self.settings.workers
        );
        let queue = self.handle.queue.clone();
        let stop = async move {
            shutdown.cancelled().await;
            queue.shut_down();
        };
        let workers =
            futures::future::join_all((0..self.settings.workers).map(|_| self.worker()));
        tokio::join!(stop, workers);
        info!("{} controller stopped", self.name());
    }

    async fn worker(&self) {
        while let Some(key) = self.handle.queue.get().await {
            debug!("Received event for {} {}", self.name(), key);
            self.process(key).await;
        }
        debug!("Queue for {} closed, ending worker", self.name());
    }

    async fn process(&self, key: ObjectRef<K>) {
        let result = match tokio::time::timeout(self.settings.sync_timeout, self.sync_key(&key))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "sync timed out after {:?}",
                self.settings.sync_timeout
            )),
        };

        match result {
            Ok(()) => {
                debug!("Event for {} {} processed", self.name(), key);
                self.handle.queue.forget(&key);
                self.handle.queue.done(&key);
            }
            Err(e) => {
                error!("Error processing {} {}: {:#}", self.name(), key, e);
                self.handle.queue.done(&key);
                self.handle.queue.add_rate_limited(key);
            }
        }
    }

    async fn sync_key(&self, key: &ObjectRef<K>) -> anyhow::Result<()> {
        let Some(obj) = self.handle.store.get(key) else {
            debug!("{} {} no longer exists, dropping", self.name(), key);
            return Ok(());
        };
        self.syncer.sync(obj).await
    }
}

/// Feeds a reflected watch stream to `on_event` until the stream ends or `shutdown` fires.
pub async fn pump_events<K, St, F>(
    kind: &str,
    stream: St,
    shutdown: CancellationToken,
    mut on_event: F,
) where
    St: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    F: FnMut(&watcher::Event<K>),
{
    futures::pin_mut!(stream);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => on_event(&event),
            Some(Err(e)) => warn!("Error watching {}: {}", kind, e),
            None => {
                warn!("Watch stream for {} ended", kind);
                return;
            }
        }
    }
}
