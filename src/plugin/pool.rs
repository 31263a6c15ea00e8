//! Bounded worker pool
//!
//! Each plugin handle owns a fixed set of workers. Idle workers sit in a
//! shared availability queue, which bounds the number of in-flight calls
//! and hands out workers in the order callers asked for them. A worker puts
//! itself back on the queue before it delivers the result, so a caller that
//! is slow to pick up its response never holds a worker.

use crate::driver::{Request, Response};
use crate::error::PluginError;
use crate::plugin::session::Session;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of the session a worker calls into.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    async fn session(&self) -> Result<Arc<dyn Session>, PluginError>;
}

struct Envelope {
    request: Request,
    respond: oneshot::Sender<Result<Response, PluginError>>,
}

#[derive(Clone)]
struct Worker {
    id: usize,
    inbox: mpsc::Sender<Envelope>,
}

pub struct WorkerPool {
    name: String,
    size: usize,
    available_rx: Mutex<mpsc::UnboundedReceiver<Worker>>,
    idle: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers and seed the availability queue with all of them.
    pub fn new(name: impl Into<String>, size: usize, provider: Arc<dyn SessionProvider>) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (available_tx, available_rx) = mpsc::unbounded_channel();
        let idle = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::with_capacity(size);
        for id in 0..size {
            let (inbox, rx) = mpsc::channel(1);
            let worker = Worker { id, inbox };
            tasks.push(tokio::spawn(run_worker(
                name.clone(),
                worker.clone(),
                rx,
                provider.clone(),
                available_tx.clone(),
                idle.clone(),
                shutdown.clone(),
            )));
            idle.fetch_add(1, Ordering::SeqCst);
            // The receiver is still in scope, so this cannot fail here.
            let _ = available_tx.send(worker);
        }

        tracing::debug!(plugin = %name, size, "Worker pool started");

        Self {
            name,
            size,
            available_rx: Mutex::new(available_rx),
            idle,
            waiting: AtomicUsize::new(0),
            shutdown,
            tasks: std::sync::Mutex::new(tasks),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently in the availability queue.
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    /// Callers currently blocked waiting for a worker.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `request` on the next free worker and wait for its result.
    pub async fn dispatch(&self, request: Request) -> Result<Response, PluginError> {
        let worker = self.acquire().await?;
        let (respond, response) = oneshot::channel();

        // A held worker's inbox is always empty, so this only fails once the
        // worker has exited.
        if worker.inbox.try_send(Envelope { request, respond }).is_err() {
            return Err(self.shutdown_error());
        }

        response.await.map_err(|_| self.shutdown_error())?
    }

    async fn acquire(&self) -> Result<Worker, PluginError> {
        if self.is_shutdown() {
            return Err(self.shutdown_error());
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let worker = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            worker = async { self.available_rx.lock().await.recv().await } => worker,
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match worker {
            Some(worker) => {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                tracing::trace!(plugin = %self.name, worker = worker.id, "Worker acquired");
                Ok(worker)
            }
            None => Err(self.shutdown_error()),
        }
    }

    /// Reclaim every worker, waiting at most `timeout` for in-flight calls,
    /// then stop the pool. Workers still busy after the deadline are aborted.
    pub async fn drain(&self, timeout: Duration) {
        let reclaim = async {
            let mut available = self.available_rx.lock().await;
            let mut reclaimed = 0;
            while reclaimed < self.size {
                match available.recv().await {
                    Some(_) => {
                        self.idle.fetch_sub(1, Ordering::SeqCst);
                        reclaimed += 1;
                    }
                    None => break,
                }
            }
            reclaimed
        };

        match tokio::time::timeout(timeout, reclaim).await {
            Ok(reclaimed) => {
                tracing::debug!(plugin = %self.name, reclaimed, "Worker pool drained");
            }
            Err(_) => {
                tracing::warn!(
                    plugin = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker pool could not finish all tasks"
                );
            }
        }

        self.shutdown.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }

    fn shutdown_error(&self) -> PluginError {
        PluginError::PoolShutdown(self.name.clone())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("idle", &self.idle())
            .field("waiting", &self.waiting())
            .finish()
    }
}

async fn run_worker(
    name: String,
    worker: Worker,
    mut inbox: mpsc::Receiver<Envelope>,
    provider: Arc<dyn SessionProvider>,
    available: mpsc::UnboundedSender<Worker>,
    idle: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = inbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let Envelope { request, respond } = envelope;
        let method = request.method();
        let result = match provider.session().await {
            Ok(session) => session.call(request).await.map_err(PluginError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::debug!(plugin = %name, worker = worker.id, method, error = %e, "Plugin call failed");
        }

        idle.fetch_add(1, Ordering::SeqCst);
        if available.send(worker.clone()).is_err() {
            idle.fetch_sub(1, Ordering::SeqCst);
        }
        // The caller may have gone away; nothing to do then.
        let _ = respond.send(result);
    }

    tracing::trace!(plugin = %name, worker = worker.id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FieldResolveInput, FieldResolveOutput, Function};
    use crate::error::TransportError;
    use serde_json::json;
    use std::time::Instant;
    use tokio::sync::Semaphore;

    /// Session whose calls block until the test opens the gate.
    struct GatedSession {
        gate: Semaphore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl GatedSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    #[async_trait]
    impl Session for GatedSession {
        async fn call(&self, request: Request) -> Result<Response, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|_| TransportError::Closed)?;
            permit.forget();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let Request::FieldResolve(input) = request else {
                return Err(TransportError::Remote("unexpected method".to_string()));
            };
            Ok(Response::FieldResolve(FieldResolveOutput {
                response: Some(json!(input.function.name)),
                error: None,
            }))
        }

        async fn ping(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct Fixed(Option<Arc<dyn Session>>);

    #[async_trait]
    impl SessionProvider for Fixed {
        async fn session(&self) -> Result<Arc<dyn Session>, PluginError> {
            self.0
                .clone()
                .ok_or_else(|| PluginError::SessionUnavailable("test".to_string()))
        }
    }

    fn request(name: &str) -> Request {
        Request::FieldResolve(FieldResolveInput {
            function: Function {
                name: name.to_string(),
            },
            ..Default::default()
        })
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_calls(pool: &Arc<WorkerPool>, n: usize) -> Vec<JoinHandle<Result<Response, PluginError>>> {
        (0..n)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.dispatch(request(&format!("call-{i}"))).await })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_calls_within_pool_size_do_not_wait() {
        let session = GatedSession::new();
        let pool = Arc::new(WorkerPool::new("test", 4, Arc::new(Fixed(Some(session.clone())))));

        let calls = spawn_calls(&pool, 4);
        wait_until("4 calls in flight", || session.in_flight.load(Ordering::SeqCst) == 4).await;
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.idle(), 0);

        session.open();
        for (i, call) in calls.into_iter().enumerate() {
            let output = FieldResolveOutput::try_from(call.await.unwrap().unwrap()).unwrap();
            assert_eq!(output.response, Some(json!(format!("call-{i}"))));
        }
        assert_eq!(pool.idle(), 4);
    }

    #[tokio::test]
    async fn test_excess_calls_wait_for_a_worker() {
        let session = GatedSession::new();
        let pool = Arc::new(WorkerPool::new("test", 2, Arc::new(Fixed(Some(session.clone())))));

        let calls = spawn_calls(&pool, 5);
        wait_until("2 calls in flight", || session.in_flight.load(Ordering::SeqCst) == 2).await;
        wait_until("3 waiting callers", || pool.waiting() == 3).await;

        session.open();
        let mut completed = 0;
        for call in calls {
            assert!(call.await.unwrap().is_ok());
            completed += 1;
        }
        assert_eq!(completed, 5);
        assert_eq!(session.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_worker_is_released_before_result_is_delivered() {
        let session = GatedSession::new();
        session.open();
        let pool = WorkerPool::new("test", 1, Arc::new(Fixed(Some(session))));

        pool.dispatch(request("first")).await.unwrap();
        assert_eq!(pool.idle(), 1);
        pool.dispatch(request("second")).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_session_fails_fast_and_releases_worker() {
        let pool = WorkerPool::new("test", 1, Arc::new(Fixed(None)));

        for _ in 0..3 {
            let err = pool.dispatch(request("x")).await.unwrap_err();
            assert!(matches!(err, PluginError::SessionUnavailable(_)));
        }
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_drain_idle_pool_is_quick() {
        let session = GatedSession::new();
        let pool = WorkerPool::new("test", 16, Arc::new(Fixed(Some(session))));

        let started = Instant::now();
        pool.drain(Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(pool.is_shutdown());

        let err = pool.dispatch(request("late")).await.unwrap_err();
        assert!(matches!(err, PluginError::PoolShutdown(_)));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_stuck_worker() {
        let session = GatedSession::new();
        let pool = Arc::new(WorkerPool::new("test", 2, Arc::new(Fixed(Some(session.clone())))));

        let stuck = spawn_calls(&pool, 1).pop().unwrap();
        wait_until("stuck call", || session.in_flight.load(Ordering::SeqCst) == 1).await;

        let started = Instant::now();
        pool.drain(Duration::from_millis(200)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));

        // The aborted worker drops the response channel.
        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(err, PluginError::PoolShutdown(_)));
    }

    #[tokio::test]
    async fn test_waiting_callers_are_released_by_shutdown() {
        let session = GatedSession::new();
        let pool = Arc::new(WorkerPool::new("test", 1, Arc::new(Fixed(Some(session.clone())))));

        let calls = spawn_calls(&pool, 3);
        wait_until("2 waiting callers", || pool.waiting() == 2).await;

        pool.drain(Duration::from_millis(50)).await;
        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(PluginError::PoolShutdown(_))
            ));
        }
    }
}
