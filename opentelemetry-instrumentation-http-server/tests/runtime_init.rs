//! Deferred installation through the runtime-initialized channel.
//!
//! The channel registry is process-global, so the whole lifecycle is
//! exercised by one sequential test in its own binary.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

use opentelemetry_instrumentation_http_server::runtime::{
    self, Handler, HandlerError, Layer, RequestEvent, ServerRuntime,
};
use opentelemetry_instrumentation_http_server::{Config, HttpServerInstrumentation};

static EXPORTER: Lazy<InMemorySpanExporter> = Lazy::new(|| {
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    global::set_tracer_provider(provider);
    exporter
});

struct Router;

#[async_trait]
impl Handler for Router {
    async fn handle(&self, event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        event.context().set_matched_route(event.path());
        event.set_response_status(StatusCode::OK);
        Ok(())
    }

    fn resolves_routes(&self) -> bool {
        true
    }
}

struct PassThrough;

#[async_trait]
impl Handler for PassThrough {
    async fn handle(&self, _event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn spans_for(path: &str) -> usize {
    EXPORTER
        .get_finished_spans()
        .expect("span export")
        .iter()
        .filter(|span| {
            span.attributes
                .iter()
                .any(|kv| kv.key.as_str() == "url.path" && kv.value == Value::from(path.to_owned()))
        })
        .count()
}

#[tokio::test]
async fn deferred_install_lifecycle() {
    Lazy::force(&EXPORTER);

    // No route-resolving layer: installation fails softly.
    let bare = Arc::new(ServerRuntime::new());
    bare.push_layer(Layer::new(Arc::new(PassThrough)));
    let routerless = HttpServerInstrumentation::new(Config::default());
    routerless.install(&bare);
    assert!(!routerless.is_installed());

    // A subscription dropped by disable() must not fire on announce.
    let cancelled = HttpServerInstrumentation::new(Config::default());
    cancelled.enable();
    cancelled.disable();

    // Enabled before the runtime exists; nothing to install onto yet.
    let deferred = HttpServerInstrumentation::new(Config::default());
    deferred.enable();
    assert!(deferred.is_enabled());
    assert!(!deferred.is_installed());

    let server = Arc::new(ServerRuntime::new());
    server.push_layer(Layer::new(Arc::new(Router)));
    runtime::announce_runtime(server.clone());

    assert!(deferred.is_installed());
    assert!(!cancelled.is_installed());

    let event = Arc::new(RequestEvent::new(Method::GET, "/deferred".parse().unwrap()));
    server.handle_request(&event).await.unwrap();

    // Exactly one span: only the live subscriber wrapped the router.
    assert_eq!(spans_for("/deferred"), 1);

    // With a runtime already announced, enable() installs immediately.
    let immediate = HttpServerInstrumentation::new(Config::default());
    immediate.enable();
    assert!(immediate.is_installed());
}
