//! Request-span instrumentation for layered HTTP server runtimes.
//!
//! This crate wraps the route-resolving layer of a server runtime's
//! handler stack and produces one server span per inbound request,
//! following the [HTTP semantic conventions]. The span is opened
//! synchronously before the original handler runs, stays active across
//! the asynchronous continuation of the request (nested render passes
//! parent correctly), and is finalized at exactly one terminal event:
//! response sent, structured handler error, generic handler error, or
//! an error outside any tracked request.
//!
//! # Components
//!
//! - [`HttpServerInstrumentation`]: the lifecycle manager: install,
//!   enable/disable, wholesale reconfiguration.
//! - [`runtime`]: the interface contract a host runtime exposes to
//!   instrumentation (handler stack, lifecycle hooks, one-shot
//!   initialization notification) and the reference dispatcher.
//! - [`PathFilter`] / [`PathRewriter`]: regex-or-literal path
//!   blocklist matching and route display-name rewriting, usable on
//!   their own inside custom hooks.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use opentelemetry_instrumentation_http_server::{Config, HttpServerInstrumentation};
//! use opentelemetry_instrumentation_http_server::runtime::{
//!     self, Handler, HandlerError, Layer, RequestEvent, ServerRuntime,
//! };
//!
//! struct Router;
//!
//! #[async_trait]
//! impl Handler for Router {
//!     async fn handle(&self, _event: &Arc<RequestEvent>) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//!
//!     fn resolves_routes(&self) -> bool {
//!         true
//!     }
//! }
//!
//! let instrumentation = HttpServerInstrumentation::new(Config::default());
//! // Install either deferred, once the runtime announces itself...
//! instrumentation.enable();
//!
//! // ...or immediately, when the runtime already exists.
//! let server = Arc::new(ServerRuntime::new());
//! server.push_layer(Layer::new(Arc::new(Router)));
//! runtime::announce_runtime(server);
//! ```
//!
//! Span export, sampling, and context propagation across network hops
//! are delegated to the configured OpenTelemetry SDK; this crate only
//! talks to the tracing API.
//!
//! [HTTP semantic conventions]: https://opentelemetry.io/docs/specs/semconv/http/http-spans/

mod headers;
mod instrumentation;
mod paths;
mod route;
pub mod runtime;

pub use instrumentation::{
    find_router_layer, Config, HttpServerInstrumentation, IgnoreRequestHook, RouteNameHook,
    SpanRecord,
};
pub use paths::{PathFilter, PathRewriter};
