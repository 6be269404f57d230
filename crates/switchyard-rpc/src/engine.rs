//! The upstream tool-invocation engine.
//!
//! The engine attaches to a [`Transport`], consumes its inbound events, and
//! answers every request through `send` with the request id as the related
//! id, so the transport can route the reply back to its caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::envelope::{Envelope, MessageKind, RequestId};
use crate::errors::RpcError;
use crate::handlers;
use crate::tools::ToolRegistry;
use crate::transport::{SendOptions, Transport, TransportError, TransportEvent};

/// Default upper bound on a single handler invocation.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Name and version reported by `initialize`.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

/// Shared state handed to every method handler.
pub struct EngineContext {
    /// Identity reported to clients.
    pub info: ServerInfo,
    /// Tools available through `tools/*`.
    pub tools: ToolRegistry,
}

/// Trait implemented by every RPC method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Value>, ctx: &EngineContext) -> Result<Value, RpcError>;
}

/// Registry mapping method names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    timeout: Duration,
}

impl MethodRegistry {
    /// Create an empty registry with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create an empty registry whose handlers are cut off after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Register a handler for a method name.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Run the handler for `method` and build the response envelope.
    pub async fn dispatch(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        ctx: &EngineContext,
    ) -> Envelope {
        counter!("rpc_requests_total", "method" => method.to_owned()).increment(1);
        let start = Instant::now();

        let outcome = match self.handlers.get(method) {
            Some(handler) => tokio::time::timeout(self.timeout, handler.handle(params, ctx))
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(RpcError::Timeout {
                        method: method.to_owned(),
                    })
                }),
            None => Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            }),
        };

        histogram!("rpc_request_duration_seconds", "method" => method.to_owned())
            .record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => Envelope::success(id, result),
            Err(err) => {
                counter!("rpc_errors_total", "method" => method.to_owned(), "error_type" => err.kind())
                    .increment(1);
                debug!(method, %id, error = %err, "request failed");
                Envelope::failure(Some(id), err.to_error_object())
            }
        }
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while attaching the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport refused to start.
    #[error("failed to attach engine to transport: {0}")]
    UpstreamConnect(#[source] TransportError),
}

/// A method registry plus the context its handlers run against.
pub struct Engine {
    registry: MethodRegistry,
    ctx: EngineContext,
}

impl Engine {
    /// Build an engine with the built-in methods registered.
    pub fn new(info: ServerInfo, tools: ToolRegistry, request_timeout: Duration) -> Self {
        let mut registry = MethodRegistry::with_timeout(request_timeout);
        handlers::register_builtin(&mut registry);
        Self {
            registry,
            ctx: EngineContext { info, tools },
        }
    }

    /// The method registry.
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Attach to `transport` and start serving its inbound events.
    ///
    /// Fails without spawning anything if the transport cannot start.
    pub async fn connect(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<EngineHandle, EngineError> {
        let events = transport.start().await.map_err(EngineError::UpstreamConnect)?;
        info!(methods = ?self.registry.methods(), tools = self.ctx.tools.len(), "engine attached to transport");
        let task = tokio::spawn(self.run(transport.clone(), events));
        Ok(EngineHandle { transport, task })
    }

    async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        self.on_message(&transport, &mut in_flight, message);
                    }
                    Some(TransportEvent::Error(error)) => warn!(%error, "transport reported an error"),
                    Some(TransportEvent::Closed) | None => break,
                },
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(finished);
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "transport closed, finishing in-flight requests");
        }
        while let Some(finished) = in_flight.join_next().await {
            reap(finished);
        }
        info!("transport closed, engine stopped");
    }

    fn on_message(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        in_flight: &mut JoinSet<()>,
        message: Envelope,
    ) {
        match message.kind() {
            MessageKind::Request => {
                let engine = Arc::clone(self);
                let transport = Arc::clone(transport);
                let _ = in_flight.spawn(async move { engine.answer(transport, message).await });
            }
            MessageKind::Notification => {
                debug!(method = message.method.as_deref().unwrap_or_default(), "notification received");
            }
            MessageKind::Response => {
                debug!(id = ?message.id, "ignoring client response, engine issues no requests");
            }
            MessageKind::Malformed => {
                warn!("ignoring message with neither method nor result");
            }
        }
    }

    #[instrument(skip_all, fields(method = ?message.method, id = ?message.id))]
    async fn answer(&self, transport: Arc<dyn Transport>, message: Envelope) {
        let (Some(id), Some(method)) = (message.id, message.method) else {
            return;
        };
        let reply = self
            .registry
            .dispatch(id.clone(), &method, message.params, &self.ctx)
            .await;
        if let Err(error) = transport.send(reply, SendOptions::related(id)).await {
            warn!(%error, "failed to send reply");
        }
    }
}

fn reap(finished: Result<(), tokio::task::JoinError>) {
    if let Err(error) = finished {
        warn!(%error, "request task ended abnormally");
    }
}

/// A running engine attached to a transport.
pub struct EngineHandle {
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Push a notification to every connected client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.transport
            .send(Envelope::notification(method, params), SendOptions::default())
            .await
    }

    /// Wait for the event loop to exit.
    ///
    /// The loop exits once the transport closes and every request already
    /// being answered has finished.
    pub async fn join(self) {
        if let Err(error) = self.task.await {
            warn!(%error, "engine task ended abnormally");
        }
    }

    /// Like [`join`](Self::join), but give up after `timeout`.
    ///
    /// Returns `true` if the loop exited in time.
    pub async fn join_with_timeout(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use mock::Recorder;
    use serde_json::json;

    use crate::tools::{EchoTool, Tool, ToolDescriptor, ToolError};

    /// A transport that records sends and exposes its inbound sender.
    mod mock {
        use std::sync::Mutex;

        use super::*;

        pub struct Recorder {
            pub sent: Mutex<Vec<(Envelope, SendOptions)>>,
            pub inbound: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
            pub fail_start: bool,
        }

        impl Recorder {
            pub fn new(fail_start: bool) -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
                let (tx, rx) = mpsc::channel(16);
                let rec = Arc::new(Self {
                    sent: Mutex::new(Vec::new()),
                    inbound: Mutex::new(Some(rx)),
                    fail_start,
                });
                (rec, tx)
            }
        }

        #[async_trait]
        impl Transport for Recorder {
            async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
                if self.fail_start {
                    return Err(TransportError::Closed);
                }
                self.inbound
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(TransportError::AlreadyStarted)
            }

            async fn send(&self, message: Envelope, options: SendOptions) -> Result<(), TransportError> {
                self.sent.lock().unwrap().push((message, options));
                Ok(())
            }

            async fn close(&self) -> Result<(), TransportError> {
                Ok(())
            }
        }
    }

    fn make_engine() -> Arc<Engine> {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        Arc::new(Engine::new(
            ServerInfo {
                name: "test".into(),
                version: "0.0.1".into(),
            },
            tools,
            Duration::from_secs(5),
        ))
    }

    struct SlowHandler;

    #[async_trait]
    impl MethodHandler for SlowHandler {
        async fn handle(&self, _params: Option<Value>, _ctx: &EngineContext) -> Result<Value, RpcError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    }

    #[test]
    fn builtin_methods_registered() {
        let engine = make_engine();
        assert_eq!(
            engine.registry().methods(),
            vec!["initialize", "ping", "tools/call", "tools/list"]
        );
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let engine = make_engine();
        let reply = engine
            .registry
            .dispatch(RequestId::from(1), "no/such", None, &engine.ctx)
            .await;
        assert_eq!(reply.error_object().unwrap().code, crate::errors::METHOD_NOT_FOUND);
        assert_eq!(reply.id, Some(RequestId::from(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out() {
        let mut registry = MethodRegistry::with_timeout(Duration::from_millis(100));
        registry.register("slow", SlowHandler);
        let ctx = EngineContext {
            info: ServerInfo {
                name: "t".into(),
                version: "0".into(),
            },
            tools: ToolRegistry::new(),
        };
        let reply = registry.dispatch(RequestId::from("s"), "slow", None, &ctx).await;
        assert_eq!(reply.error_object().unwrap().code, crate::errors::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn connect_fails_when_transport_refuses() {
        let (rec, _tx) = Recorder::new(true);
        let result = make_engine().connect(rec).await;
        assert!(matches!(result, Err(EngineError::UpstreamConnect(_))));
    }

    #[tokio::test]
    async fn request_is_answered_with_related_id() {
        let (rec, tx) = Recorder::new(false);
        let handle = make_engine().connect(rec.clone()).await.unwrap();

        tx.send(TransportEvent::Message(Envelope::request(42, "ping", None)))
            .await
            .unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();
        handle.join().await;

        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (reply, opts) = &sent[0];
        assert_eq!(reply.id, Some(RequestId::from(42)));
        assert_eq!(reply.result, Some(json!({})));
        assert_eq!(opts.related_request_id, Some(RequestId::from(42)));
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "slow".into(),
                description: "Answers after a while".into(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn call(&self, _arguments: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok("finally".into())
        }
    }

    fn slow_engine() -> Arc<Engine> {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(SlowTool));
        Arc::new(Engine::new(
            ServerInfo {
                name: "test".into(),
                version: "0.0.1".into(),
            },
            tools,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_in_flight_requests() {
        let (rec, tx) = Recorder::new(false);
        let handle = slow_engine().connect(rec.clone()).await.unwrap();

        let call = Envelope::request(9, "tools/call", Some(json!({"name": "slow", "arguments": {}})));
        tx.send(TransportEvent::Message(call)).await.unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();
        handle.join().await;

        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.result.as_ref().unwrap()["content"][0]["text"], "finally");
    }

    #[tokio::test(start_paused = true)]
    async fn join_with_timeout_gives_up_on_stuck_requests() {
        let (rec, tx) = Recorder::new(false);
        let handle = slow_engine().connect(rec.clone()).await.unwrap();

        let call = Envelope::request(1, "tools/call", Some(json!({"name": "slow", "arguments": {}})));
        tx.send(TransportEvent::Message(call)).await.unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();

        assert!(!handle.join_with_timeout(Duration::from_millis(500)).await);
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let (rec, tx) = Recorder::new(false);
        let handle = make_engine().connect(rec.clone()).await.unwrap();

        tx.send(TransportEvent::Message(Envelope::notification(
            "notifications/initialized",
            None,
        )))
        .await
        .unwrap();
        tx.send(TransportEvent::Error("sink died".into())).await.unwrap();
        drop(tx);
        handle.join().await;

        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notify_sends_without_related_id() {
        let (rec, _tx) = Recorder::new(false);
        let handle = make_engine().connect(rec.clone()).await.unwrap();
        handle
            .notify("notifications/tools/list_changed", None)
            .await
            .unwrap();

        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent[0].0.method.as_deref(), Some("notifications/tools/list_changed"));
        assert!(sent[0].1.related_request_id.is_none());
    }
}
