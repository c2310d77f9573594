//! The service runtime core.

use futures_util::future::{BoxFuture, FutureExt};
use sb_bus::{BusClient, BusEvent};
use sb_proto::envelope::{
    listener_channel, listener_id, Body, Envelope, RequestBody, ResponseBody, ResponseType,
    WorkerCounters, HEALTHCHECK_CHANNEL,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::InfraConfig;
use crate::error::{Rejection, ServiceError};
use crate::liveness::LivenessTable;
use crate::pinger::PingRound;
use crate::reply::{Reply, ResponseStream};
use crate::request::Request;

/// Environment variable carrying the worker index of a fanned-out process.
const WORKER_ENV: &str = "SERVICE_WORKER";

type HandlerFuture = BoxFuture<'static, Result<(), ServiceError>>;
type HandlerFn = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;
type HookFn = Arc<dyn Fn(Service) -> BoxFuture<'static, ()> + Send + Sync>;
type MessageHookFn = Arc<dyn Fn(Service, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options for an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Pin a specific worker instead of round-robin selection.
    pub worker: Option<u32>,
    /// Overall timeout for the arrival of the first reply.
    pub timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> RequestOptions {
        RequestOptions {
            worker: None,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Collects handlers and hooks before the service goes live.
pub struct ServiceBuilder {
    name: String,
    worker: Option<u32>,
    infra: Option<InfraConfig>,
    handlers: HashMap<String, HandlerFn>,
    on_boot: Option<HookFn>,
    on_stop: Option<HookFn>,
    on_message: Option<MessageHookFn>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            worker: None,
            infra: None,
            handlers: HashMap::new(),
            on_boot: None,
            on_stop: None,
            on_message: None,
        }
    }

    /// Pin the worker index (tests and embedded use; [`ServiceBuilder::run`]
    /// resolves it from the environment).
    pub fn worker(mut self, worker: u32) -> ServiceBuilder {
        self.worker = Some(worker);
        self
    }

    /// Override the environment-derived infrastructure config.
    pub fn infra(mut self, infra: InfraConfig) -> ServiceBuilder {
        self.infra = Some(infra);
        self
    }

    /// Register the handler for a request type.
    pub fn on_request<F, Fut>(mut self, request_type: &str, handler: F) -> ServiceBuilder
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.handlers
            .insert(request_type.to_owned(), Arc::new(move |req| handler(req).boxed()));
        self
    }

    /// Hook fired once the bus is up, before the service starts accepting.
    pub fn on_boot<F, Fut>(mut self, hook: F) -> ServiceBuilder
    where
        F: Fn(Service) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_boot = Some(Arc::new(move |service| hook(service).boxed()));
        self
    }

    /// Hook fired after the in-flight drain on shutdown.
    pub fn on_stop<F, Fut>(mut self, hook: F) -> ServiceBuilder
    where
        F: Fn(Service) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_stop = Some(Arc::new(move |service| hook(service).boxed()));
        self
    }

    /// Hook for listener-channel payloads that are neither requests nor
    /// responses (e.g. the updater's `update-done` broadcast).
    pub fn on_message<F, Fut>(mut self, hook: F) -> ServiceBuilder
    where
        F: Fn(Service, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message = Some(Arc::new(move |service, value| hook(service, value).boxed()));
        self
    }

    /// Connect the bus, bind the listener channels and go live.
    pub async fn start(self) -> Result<Service, ServiceError> {
        let worker = self.worker.or_else(env_worker_index).unwrap_or(0);
        let infra = self.infra.unwrap_or_else(InfraConfig::from_env);

        let (bus, bus_events) = BusClient::new(infra.bus_config());
        bus.start().await?;

        let my_channel = listener_channel(&self.name, worker);
        let service = Service {
            inner: Arc::new(ServiceInner {
                name: self.name,
                worker,
                my_channel: my_channel.clone(),
                infra,
                bus,
                accepting: AtomicBool::new(false),
                open_requests: AtomicUsize::new(0),
                success: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                handlers: self.handlers,
                on_boot: self.on_boot,
                on_stop: self.on_stop,
                on_message: self.on_message,
                waiters: Mutex::new(HashMap::new()),
                liveness: Mutex::new(LivenessTable::new()),
                next_ping_at: Mutex::new(None),
                ping_round: Mutex::new(None),
                event_task: Mutex::new(None),
            }),
        };

        service.inner.bus.subscribe(&my_channel).await?;
        service.inner.bus.subscribe(HEALTHCHECK_CHANNEL).await?;
        let event_task = tokio::spawn(event_loop(service.clone(), bus_events));
        *service.inner.event_task.lock().expect("event task lock") = Some(event_task);

        if let Some(hook) = &service.inner.on_boot {
            hook(service.clone()).await;
        }
        service.inner.accepting.store(true, Ordering::SeqCst);
        info!(
            service = %service.inner.name,
            worker = service.inner.worker,
            "service accepting requests"
        );
        Ok(service)
    }

    /// Run as an executable service with `workers` processes.
    ///
    /// The primary process (no worker index in the environment) re-executes
    /// the current binary for workers 1..W; every process rebuilds the same
    /// handler registry and binds its own listener channel.  Blocks until
    /// SIGINT/SIGTERM, then drains in-flight requests and terminates the
    /// children.
    pub async fn run(mut self, workers: u32) -> Result<(), ServiceError> {
        let env_worker = env_worker_index();
        let is_primary = self.worker.is_none() && env_worker.is_none();
        let worker = self.worker.or(env_worker).unwrap_or(0);

        let mut children = Vec::new();
        if is_primary && workers > 1 {
            let exe = env::current_exe()?;
            for index in 1..workers {
                let child = tokio::process::Command::new(&exe)
                    .env(WORKER_ENV, index.to_string())
                    .kill_on_drop(true)
                    .spawn()?;
                children.push(child);
            }
            info!(spawned = children.len(), "worker processes started");
        }

        self.worker = Some(worker);
        let service = self.start().await?;

        shutdown_signal().await;
        service.shutdown().await;

        for mut child in children {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to terminate worker process");
            }
        }
        Ok(())
    }
}

fn env_worker_index() -> Option<u32> {
    env::var(WORKER_ENV).ok().and_then(|raw| raw.parse().ok())
}

/// A live service handle.
///
/// Cheap to clone; handlers receive one through their [`Request`] and
/// background tasks hold their own.
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    name: String,
    worker: u32,
    my_channel: String,
    pub(crate) infra: InfraConfig,
    bus: BusClient,
    accepting: AtomicBool,
    open_requests: AtomicUsize,
    success: AtomicU64,
    errors: AtomicU64,
    handlers: HashMap<String, HandlerFn>,
    on_boot: Option<HookFn>,
    on_stop: Option<HookFn>,
    on_message: Option<MessageHookFn>,
    waiters: Mutex<HashMap<String, mpsc::UnboundedSender<ResponseBody>>>,
    liveness: Mutex<LivenessTable>,
    next_ping_at: Mutex<Option<Instant>>,
    pub(crate) ping_round: Mutex<Option<PingRound>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn worker(&self) -> u32 {
        self.inner.worker
    }

    /// Canonical `name@worker` id of this listener.
    pub fn listener_id(&self) -> String {
        listener_id(&self.inner.name, self.inner.worker)
    }

    /// The underlying bus client (raw publishes, e.g. notifications).
    pub fn bus(&self) -> &BusClient {
        &self.inner.bus
    }

    /// Success/error counters accumulated since the last ping.
    pub fn counters(&self) -> WorkerCounters {
        WorkerCounters {
            success: self.inner.success.load(Ordering::SeqCst),
            errors: self.inner.errors.load(Ordering::SeqCst),
        }
    }

    /// When the next healthcheck ping is expected, if one ever arrived.
    pub fn next_ping_at(&self) -> Option<Instant> {
        *self.inner.next_ping_at.lock().expect("ping state lock")
    }

    /// Run a blocking job on the blocking pool and await its result.
    ///
    /// The offload primitive for CPU-bound work (e.g. credential hashing).
    pub async fn offload<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|err| ServiceError::Handler(format!("offloaded job failed: {err}")))
    }

    /// Issue a request with default options (round-robin worker, 1 s timeout).
    pub async fn request(
        &self,
        target: &str,
        request_type: &str,
        data: Map<String, Value>,
    ) -> Result<Reply, ServiceError> {
        self.request_with(target, request_type, data, RequestOptions::default())
            .await
    }

    /// Issue a request to `target` and await its first reply.
    ///
    /// Fails fast with [`ServiceError::Unavailable`] when the liveness
    /// window is valid but the chosen listener did not answer the last
    /// ping round.
    pub async fn request_with(
        &self,
        target: &str,
        request_type: &str,
        data: Map<String, Value>,
        options: RequestOptions,
    ) -> Result<Reply, ServiceError> {
        let worker = match options.worker {
            Some(worker) => worker,
            None => self
                .inner
                .liveness
                .lock()
                .expect("liveness lock")
                .select_worker(target),
        };

        {
            let liveness = self.inner.liveness.lock().expect("liveness lock");
            if liveness.window_valid() && !liveness.is_listed(&listener_id(target, worker)) {
                return Err(ServiceError::Unavailable);
            }
        }

        let request_id = Uuid::new_v4().simple().to_string();
        let mut rx = self.register_waiter(&request_id);

        let body = Body::Request(RequestBody {
            request_type: request_type.to_owned(),
            request_id: request_id.clone(),
            data,
        });
        if let Err(err) = self
            .publish_envelope(&listener_channel(target, worker), body)
            .await
        {
            self.unregister_waiter(&request_id);
            return Err(err);
        }

        let first = match timeout(options.timeout, rx.recv()).await {
            Err(_) => {
                self.unregister_waiter(&request_id);
                return Err(ServiceError::Timeout);
            }
            Ok(None) => {
                self.unregister_waiter(&request_id);
                return Err(ServiceError::Remote);
            }
            Ok(Some(response)) => response,
        };

        match first.response_type {
            ResponseType::Stream => Ok(Reply::Stream(ResponseStream::new(
                self.clone(),
                request_id,
                rx,
            ))),
            ResponseType::Simple => {
                self.unregister_waiter(&request_id);
                Ok(Reply::Simple(first.content))
            }
            ResponseType::End => {
                self.unregister_waiter(&request_id);
                Ok(Reply::Simple(None))
            }
            ResponseType::Reject => {
                self.unregister_waiter(&request_id);
                Err(ServiceError::Rejected(Rejection {
                    kind: first
                        .rejection_type
                        .unwrap_or_else(|| "UnknownRejection".to_owned()),
                    args: first.args,
                    kwargs: first.kwargs,
                }))
            }
            ResponseType::Error => {
                self.unregister_waiter(&request_id);
                Err(ServiceError::Remote)
            }
            ResponseType::Content => {
                self.unregister_waiter(&request_id);
                warn!(request_id, "content frame before stream opener");
                Err(ServiceError::Remote)
            }
        }
    }

    /// Stop accepting, drain in-flight requests, fire `on_stop`, then stop
    /// the event loop (the listener goes silent, pings included).
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        while self.inner.open_requests.load(Ordering::SeqCst) > 0 {
            sleep(Duration::from_millis(500)).await;
        }
        if let Some(hook) = &self.inner.on_stop {
            hook(self.clone()).await;
        }
        if let Some(task) = self.inner.event_task.lock().expect("event task lock").take() {
            task.abort();
        }
        info!(service = %self.inner.name, worker = self.inner.worker, "drained and stopped");
    }

    // -----------------------------------------------------------------------
    // Internal plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn register_waiter(&self, request_id: &str) -> mpsc::UnboundedReceiver<ResponseBody> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .waiters
            .lock()
            .expect("waiter registry lock")
            .insert(request_id.to_owned(), tx);
        rx
    }

    pub(crate) fn unregister_waiter(&self, request_id: &str) {
        self.inner
            .waiters
            .lock()
            .expect("waiter registry lock")
            .remove(request_id);
    }

    pub(crate) async fn publish_envelope(
        &self,
        channel: &str,
        body: Body,
    ) -> Result<(), ServiceError> {
        let envelope = Envelope {
            source: self.inner.name.clone(),
            worker: self.inner.worker,
            body,
        };
        self.inner.bus.publish(channel, envelope.to_json()).await?;
        Ok(())
    }

    pub(crate) async fn send_response(
        &self,
        target: &str,
        worker: u32,
        body: ResponseBody,
    ) -> Result<(), ServiceError> {
        self.publish_envelope(&listener_channel(target, worker), Body::Response(body))
            .await
    }

    async fn handle_channel_message(&self, channel: &str, payload: &str) {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(channel, error = %err, "discarding non-JSON payload");
                return;
            }
        };

        if channel == self.inner.my_channel {
            match serde_json::from_value::<Envelope>(value.clone()) {
                Ok(envelope) => match envelope.body {
                    Body::Request(body) => {
                        self.accept_request(envelope.source, envelope.worker, body);
                    }
                    Body::Response(body) => self.route_response(body),
                    Body::Pong {
                        ping_id,
                        success,
                        errors,
                    } => self.record_pong(
                        &envelope.source,
                        envelope.worker,
                        &ping_id,
                        WorkerCounters { success, errors },
                    ),
                    _ => self.dispatch_message(value),
                },
                // Unknown types are application traffic, not an error.
                Err(_) => self.dispatch_message(value),
            }
        } else if channel == HEALTHCHECK_CHANNEL {
            match serde_json::from_value::<Envelope>(value) {
                Ok(envelope) => self.handle_healthcheck(envelope),
                Err(err) => debug!(error = %err, "ignoring unknown healthcheck payload"),
            }
        }
    }

    /// Run the registered handler for an incoming request.
    ///
    /// Unknown types and requests received while not accepting get a bare
    /// `end`.  A handler error (or panic) produces an `error` response; a
    /// normal return with the request still alive gets a synthesized `end`.
    fn accept_request(&self, source: String, source_worker: u32, body: RequestBody) {
        let request_type = body.request_type.clone();
        let request = Request::new(self.clone(), source, source_worker, body);

        if !self.inner.accepting.load(Ordering::SeqCst) {
            debug!(request_type, "request while not accepting");
            tokio::spawn(async move {
                let _ = request.end().await;
            });
            return;
        }

        let Some(handler) = self.inner.handlers.get(&request_type).cloned() else {
            warn!(request_type, "no handler for request type");
            tokio::spawn(async move {
                let _ = request.end().await;
            });
            return;
        };

        self.inner.open_requests.fetch_add(1, Ordering::SeqCst);
        let service = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler(request.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    service.inner.success.fetch_add(1, Ordering::SeqCst);
                    if request.is_alive() {
                        let _ = request.end().await;
                    }
                }
                Ok(Err(err)) => {
                    service.inner.errors.fetch_add(1, Ordering::SeqCst);
                    warn!(request_type = request.request_type(), error = %err, "handler failed");
                    let _ = request.error().await;
                }
                Err(_) => {
                    service.inner.errors.fetch_add(1, Ordering::SeqCst);
                    error!(request_type = request.request_type(), "handler panicked");
                    let _ = request.error().await;
                }
            }
            service.inner.open_requests.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn route_response(&self, body: ResponseBody) {
        let waiters = self.inner.waiters.lock().expect("waiter registry lock");
        match waiters.get(&body.request_id) {
            Some(waiter) => {
                let _ = waiter.send(body);
            }
            None => debug!(request_id = %body.request_id, "response with no waiter"),
        }
    }

    fn dispatch_message(&self, value: Value) {
        if let Some(hook) = &self.inner.on_message {
            let fut = hook(self.clone(), value);
            tokio::spawn(fut);
        }
    }

    fn handle_healthcheck(&self, envelope: Envelope) {
        let Envelope {
            source,
            worker,
            body,
        } = envelope;
        match body {
            Body::Ping { ping_id } => {
                let success = self.inner.success.swap(0, Ordering::SeqCst);
                let errors = self.inner.errors.swap(0, Ordering::SeqCst);
                *self.inner.next_ping_at.lock().expect("ping state lock") = Some(
                    Instant::now() + self.inner.infra.ping_delay - self.inner.infra.ping_timeout,
                );

                let service = self.clone();
                tokio::spawn(async move {
                    let pong = Body::Pong {
                        ping_id,
                        success,
                        errors,
                    };
                    let channel = listener_channel(&source, worker);
                    if let Err(err) = service.publish_envelope(&channel, pong).await {
                        warn!(error = %err, "failed to answer ping");
                    }
                });
            }
            Body::PingResult { pings } => {
                self.inner
                    .liveness
                    .lock()
                    .expect("liveness lock")
                    .apply_ping_result(pings, self.inner.infra.ping_delay * 2);
            }
            _ => {}
        }
    }
}

async fn event_loop(service: Service, mut events: mpsc::UnboundedReceiver<BusEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            BusEvent::ChannelMessage { channel, payload } => {
                service.handle_channel_message(&channel, &payload).await;
            }
            BusEvent::ConnectionMade { link } => debug!(%link, "bus link up"),
            BusEvent::ConnectionLost { link } => warn!(%link, "bus link down"),
        }
    }
}

/// Wait for SIGTERM or Ctrl-C (SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        () = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
