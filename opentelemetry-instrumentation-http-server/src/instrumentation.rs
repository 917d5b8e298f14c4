//! The request-span lifecycle manager.
//!
//! [`HttpServerInstrumentation`] installs itself once per process into
//! a runtime's handler stack, opens a server span when the wrapped
//! router handler begins, stores the span record in the per-request
//! context, and finalizes the span at exactly one terminal event:
//! after-response for successful requests, the error hook otherwise.
//! Route attributes are recomputed in the before-response hook, once
//! routing has completed but before the response is flushed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{
    FutureExt, SpanKind, SpanRef, Status, TraceContextExt, Tracer, TracerProvider,
};
use opentelemetry::{otel_warn, Context, InstrumentationScope, KeyValue};
use opentelemetry_semantic_conventions::attribute;

use crate::headers::{request_header_attributes, response_header_attributes};
use crate::paths::{PathFilter, PathRewriter};
use crate::route::resolve_route_name;
use crate::runtime::{
    self, Handler, HandlerError, InitSubscription, Layer, RequestEvent, ServerRuntime,
};

/// `error.type` value when no more specific classification exists.
const UNKNOWN_ERROR_TYPE: &str = "Unknown Error";

static SCOPE: Lazy<InstrumentationScope> = Lazy::new(|| {
    InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
});

/// The tracer is resolved against the global provider per use, so a
/// provider installed after the instrumentation is picked up without a
/// restart.
fn tracer() -> BoxedTracer {
    global::tracer_provider().tracer_with_scope(SCOPE.clone())
}

/// Per-request tracing state: the activation context holding the open
/// span, and the optional handler-completion timestamp the finalizing
/// hook closes the span with.
#[derive(Clone, Debug)]
pub struct SpanRecord {
    cx: Context,
    end_time: Option<SystemTime>,
}

impl SpanRecord {
    fn new(cx: Context) -> Self {
        SpanRecord { cx, end_time: None }
    }

    /// The context that makes this request's span the active span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn end_timestamp(&self) -> Option<SystemTime> {
        self.end_time
    }

    pub(crate) fn set_end_time(&mut self, end_time: SystemTime) {
        self.end_time = Some(end_time);
    }

    fn span(&self) -> SpanRef<'_> {
        self.cx.span()
    }

    /// Ends the span at the recorded completion time when one exists.
    /// Ending an already-ended span is a no-op per the tracing API, so
    /// the hooks do not coordinate beyond first-wins.
    fn end(&self) {
        match self.end_time {
            Some(end_time) => self.span().end_with_timestamp(end_time),
            None => self.span().end(),
        }
    }
}

/// Hook overriding the resolved route name for a request.
pub type RouteNameHook = Arc<dyn Fn(&RequestEvent) -> Option<String> + Send + Sync>;
/// Predicate excluding a request from tracing entirely.
pub type IgnoreRequestHook = Arc<dyn Fn(&RequestEvent) -> bool + Send + Sync>;

/// Instrumentation configuration. Replaced wholesale by
/// [`HttpServerInstrumentation::set_config`]; never merged.
#[derive(Clone)]
pub struct Config {
    /// Initial enabled state; toggled afterwards via
    /// [`HttpServerInstrumentation::enable`] / `disable`.
    pub enabled: bool,
    /// Regex-or-literal pattern for paths excluded from tracing.
    pub path_blocklist: Option<String>,
    /// `[matcher, replacement]` rewrite applied to route names.
    pub path_rewrite: Option<[String; 2]>,
    /// Request headers captured as span attributes.
    pub request_headers: Vec<String>,
    /// Response headers captured as span attributes.
    pub response_headers: Vec<String>,
    pub route_name_hook: Option<RouteNameHook>,
    pub ignore_request_hook: Option<IgnoreRequestHook>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            path_blocklist: None,
            path_rewrite: None,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            route_name_hook: None,
            ignore_request_hook: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("enabled", &self.enabled)
            .field("path_blocklist", &self.path_blocklist)
            .field("path_rewrite", &self.path_rewrite)
            .field("request_headers", &self.request_headers)
            .field("response_headers", &self.response_headers)
            .field("route_name_hook", &self.route_name_hook.is_some())
            .field("ignore_request_hook", &self.ignore_request_hook.is_some())
            .finish()
    }
}

/// One configuration snapshot with its compiled path helpers.
struct ConfigState {
    config: Config,
    filter: PathFilter,
    rewriter: PathRewriter,
}

impl ConfigState {
    fn new(config: Config) -> Self {
        let filter = PathFilter::new(config.path_blocklist.as_deref());
        let rewriter = PathRewriter::new(config.path_rewrite.as_ref().map(|rule| rule.as_slice()));
        ConfigState {
            config,
            filter,
            rewriter,
        }
    }

    fn skip(&self, event: &RequestEvent) -> bool {
        if self.filter.matches(event.path()) {
            return true;
        }
        self.config
            .ignore_request_hook
            .as_ref()
            .is_some_and(|hook| hook(event))
    }
}

/// Locates the route-resolving layer in the runtime's handler stack.
///
/// Not-found is a soft failure for the caller: installation warns once
/// and leaves the process untraced.
pub fn find_router_layer(layers: &[Layer]) -> Option<usize> {
    layers
        .iter()
        .position(|layer| layer.handler().resolves_routes())
}

struct Inner {
    state: RwLock<Arc<ConfigState>>,
    enabled: AtomicBool,
    installed: AtomicBool,
    subscription: Mutex<Option<InitSubscription>>,
}

/// Request-span instrumentation for a layered HTTP server runtime.
pub struct HttpServerInstrumentation {
    inner: Arc<Inner>,
}

impl HttpServerInstrumentation {
    pub fn new(config: Config) -> Self {
        let enabled = config.enabled;
        HttpServerInstrumentation {
            inner: Arc::new(Inner {
                state: RwLock::new(Arc::new(ConfigState::new(config))),
                enabled: AtomicBool::new(enabled),
                installed: AtomicBool::new(false),
                subscription: Mutex::new(None),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.inner.installed.load(Ordering::SeqCst)
    }

    /// Replaces the configuration wholesale. The next request observes
    /// the new snapshot; in-flight spans are unaffected. The enabled
    /// flag is controlled by [`enable`](Self::enable) /
    /// [`disable`](Self::disable), not by the snapshot.
    pub fn set_config(&self, config: Config) {
        *self.inner.state.write().expect("config lock poisoned") =
            Arc::new(ConfigState::new(config));
    }

    /// Subscribes to the runtime-initialized notification (idempotent)
    /// and installs immediately when a runtime instance already exists,
    /// then marks the instrumentation enabled.
    pub fn enable(&self) {
        {
            let mut subscription = self
                .inner
                .subscription
                .lock()
                .expect("subscription lock poisoned");
            if subscription.is_none() {
                let inner = self.inner.clone();
                *subscription = Some(runtime::on_runtime_init(move |runtime| {
                    Inner::install(&inner, runtime);
                }));
            }
        }
        if let Some(runtime) = runtime::current_runtime() {
            Inner::install(&self.inner, &runtime);
        }
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Drops the notification subscription and stops new spans. The
    /// spliced wrapper stays in the handler stack; uninstalling is not
    /// supported.
    pub fn disable(&self) {
        self.inner
            .subscription
            .lock()
            .expect("subscription lock poisoned")
            .take();
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    /// Installs the instrumentation into a runtime: registers the
    /// lifecycle hooks and substitutes the wrapped router handler.
    /// At most one installation happens per instrumentation instance.
    pub fn install(&self, runtime: &Arc<ServerRuntime>) {
        Inner::install(&self.inner, runtime);
    }
}

impl Inner {
    fn install(inner: &Arc<Inner>, runtime: &Arc<ServerRuntime>) {
        if inner.installed.load(Ordering::SeqCst) {
            return;
        }

        let Some(index) = runtime.with_layers(find_router_layer) else {
            otel_warn!(
                name: "HttpServerInstrumentation.RouterLayerNotFound",
                message = "unable to find the route-resolving layer; requests will not be traced"
            );
            return;
        };
        let Some(original) = runtime.layer_handler(index) else {
            return;
        };

        // Routing has completed here but the response has not been
        // flushed, so the recomputed route is visible on the span
        // before clients observe it.
        {
            let inner = inner.clone();
            runtime.on_before_response(move |event| {
                if let Some(record) = event.context().span_record() {
                    inner.update_route_attributes(event, &record);
                }
                Ok(())
            });
        }

        {
            let inner = inner.clone();
            runtime.on_after_response(move |event| {
                if let Some(record) = event.context().span_record() {
                    inner.finish_response(event, &record);
                }
            });
        }

        {
            let inner = inner.clone();
            runtime.on_error(move |error, event| inner.finish_error(error, event));
        }

        runtime.replace_layer_handler(
            index,
            Arc::new(TracedHandler {
                inner: inner.clone(),
                delegate: original,
            }),
        );
        inner.installed.store(true, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Arc<ConfigState> {
        self.state.read().expect("config lock poisoned").clone()
    }

    fn update_route_attributes(&self, event: &RequestEvent, record: &SpanRecord) {
        let state = self.snapshot();
        let route = resolve_route_name(event, &state.rewriter, state.config.route_name_hook.as_ref());
        let span = record.span();
        span.update_name(format!("{} {}", event.method(), route));
        span.set_attribute(KeyValue::new(attribute::HTTP_ROUTE, route));
    }

    /// Finalizes a request whose response was sent, including ones
    /// that recovered into an error response.
    fn finish_response(&self, event: &RequestEvent, record: &SpanRecord) {
        let state = self.snapshot();
        let span = record.span();
        let status = event.response_status();

        // Only 5xx marks a server span as error; 4xx is a client
        // fault and stays OK per the HTTP semantic conventions.
        if status.is_server_error() {
            span.set_attribute(KeyValue::new(attribute::ERROR_TYPE, UNKNOWN_ERROR_TYPE));
            span.set_status(Status::error(""));
        } else {
            span.set_status(Status::Ok);
        }

        span.set_attribute(KeyValue::new(
            attribute::HTTP_RESPONSE_STATUS_CODE,
            i64::from(status.as_u16()),
        ));
        for header_attribute in response_header_attributes(event, &state.config.response_headers) {
            span.set_attribute(header_attribute);
        }

        record.end();
    }

    fn finish_error(&self, error: &HandlerError, event: Option<&Arc<RequestEvent>>) {
        let Some(event) = event else {
            // Outside any tracked request: best effort against the
            // ambient active span, otherwise the error is dropped
            // from tracing.
            let cx = Context::current();
            if cx.has_active_span() {
                let span = cx.span();
                span.record_error(error);
                span.end();
            }
            return;
        };

        let Some(record) = event.context().span_record() else {
            return;
        };
        let state = self.snapshot();
        let span = record.span();

        match error {
            HandlerError::Http(error) => {
                if error.status().is_server_error() {
                    span.set_attribute(KeyValue::new(attribute::ERROR_TYPE, UNKNOWN_ERROR_TYPE));
                    span.set_status(Status::error(""));
                }
                span.set_attribute(KeyValue::new(
                    attribute::HTTP_RESPONSE_STATUS_CODE,
                    i64::from(error.status().as_u16()),
                ));
                if let Some(cause) = error.cause() {
                    span.record_error(cause);
                    span.set_attribute(KeyValue::new(attribute::ERROR_TYPE, cause.to_string()));
                }
            }
            HandlerError::Unexpected(source) => {
                span.record_error(source.as_ref());
                span.set_attribute(KeyValue::new(attribute::ERROR_TYPE, source.to_string()));
                span.set_status(Status::error(""));
                // The true status cannot be read from the response
                // record yet; the error has not been rendered into it.
                span.set_attribute(KeyValue::new(attribute::HTTP_RESPONSE_STATUS_CODE, 500_i64));
            }
            HandlerError::Opaque(_) => {
                span.set_attribute(KeyValue::new(attribute::ERROR_TYPE, UNKNOWN_ERROR_TYPE));
                span.set_status(Status::error(""));
                span.set_attribute(KeyValue::new(attribute::HTTP_RESPONSE_STATUS_CODE, 500_i64));
            }
        }

        for header_attribute in response_header_attributes(event, &state.config.response_headers) {
            span.set_attribute(header_attribute);
        }
        self.update_route_attributes(event, &record);
        record.end();
    }
}

/// The wrapped router handler spliced into the stack: opens the span,
/// activates its context for the delegated (possibly asynchronous)
/// call, and stamps the completion time on success. The hooks perform
/// the actual span end once routing metadata is final.
struct TracedHandler {
    inner: Arc<Inner>,
    delegate: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for TracedHandler {
    async fn handle(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        let state = self.inner.snapshot();
        if !self.inner.enabled.load(Ordering::SeqCst) || state.skip(event) {
            return self.delegate.handle(event).await;
        }

        let route =
            resolve_route_name(event, &state.rewriter, state.config.route_name_hook.as_ref());

        let mut attributes = vec![
            KeyValue::new(attribute::HTTP_REQUEST_METHOD, event.method().to_string()),
            KeyValue::new(attribute::URL_PATH, event.path().to_owned()),
            KeyValue::new(attribute::URL_SCHEME, event.scheme().to_owned()),
            KeyValue::new(attribute::NETWORK_PROTOCOL_NAME, "http"),
            KeyValue::new(attribute::NETWORK_PROTOCOL_VERSION, event.protocol_version()),
        ];
        if let Some(address) = event.client_address() {
            attributes.push(KeyValue::new(attribute::CLIENT_ADDRESS, address.clone()));
            attributes.push(KeyValue::new(attribute::NETWORK_PEER_ADDRESS, address));
        }
        if let Some(port) = event.client_port() {
            attributes.push(KeyValue::new(attribute::CLIENT_PORT, i64::from(port)));
            attributes.push(KeyValue::new(attribute::NETWORK_PEER_PORT, i64::from(port)));
        }
        if let Some(address) = event.server_address() {
            attributes.push(KeyValue::new(attribute::SERVER_ADDRESS, address));
        }
        if let Some(port) = event.server_port() {
            attributes.push(KeyValue::new(attribute::SERVER_PORT, i64::from(port)));
        }
        if let Some(user_agent) = event.user_agent() {
            attributes.push(KeyValue::new(attribute::USER_AGENT_ORIGINAL, user_agent));
        }
        if let Some(query) = event.query() {
            attributes.push(KeyValue::new(attribute::URL_QUERY, query.to_owned()));
        }
        attributes.extend(request_header_attributes(event, &state.config.request_headers));

        let tracer = tracer();
        let parent_cx = Context::current();
        let span = tracer
            .span_builder(format!("{} {}", event.method(), route))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(&tracer, &parent_cx);
        let cx = parent_cx.with_span(span);

        event.context().set_span_record(SpanRecord::new(cx.clone()));

        // The delegate runs with the span active so nested work picks
        // it up as parent across suspension points.
        let result = self.delegate.handle(event).with_context(cx).await;
        if result.is_ok() {
            event.context().record_span_end_time(SystemTime::now());
        }
        result
    }

    fn resolves_routes(&self) -> bool {
        true
    }
}
