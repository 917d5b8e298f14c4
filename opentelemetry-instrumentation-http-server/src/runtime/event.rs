//! Per-request event object and its context bag.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use http::header::{HeaderName, HeaderValue, HOST, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::instrumentation::SpanRecord;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// One inbound request as seen by the runtime's handler stack and
/// lifecycle hooks. The request side is immutable; the response record
/// and the context bag are filled in as handling progresses.
pub struct RequestEvent {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    peer_addr: Option<SocketAddr>,
    response: Mutex<ResponseRecord>,
    context: EventContext,
}

#[derive(Default)]
struct ResponseRecord {
    status: StatusCode,
    headers: HeaderMap,
}

impl RequestEvent {
    pub fn new(method: Method, uri: Uri) -> Self {
        RequestEvent {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            peer_addr: None,
            response: Mutex::new(ResponseRecord::default()),
            context: EventContext::default(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Appends a request header, preserving earlier occurrences.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a request header, if present and valid UTF-8.
    pub fn header(&self, name: HeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
    }

    pub fn user_agent(&self) -> Option<String> {
        self.header(USER_AGENT)
    }

    pub fn server_address(&self) -> Option<String> {
        self.uri
            .host()
            .map(ToOwned::to_owned)
            .or_else(|| self.header(HOST).map(|host| strip_port(&host).to_owned()))
    }

    pub fn server_port(&self) -> Option<u16> {
        self.uri.port_u16()
    }

    /// Client address with forwarded-for resolution: the first
    /// `x-forwarded-for` element wins over the peer socket address.
    pub fn client_address(&self) -> Option<String> {
        if let Some(forwarded) = self.header(X_FORWARDED_FOR) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return Some(first.to_owned());
                }
            }
        }
        self.peer_addr.map(|addr| addr.ip().to_string())
    }

    pub fn client_port(&self) -> Option<u16> {
        self.peer_addr.map(|addr| addr.port())
    }

    pub fn protocol_version(&self) -> &'static str {
        if self.version == Version::HTTP_09 {
            "0.9"
        } else if self.version == Version::HTTP_10 {
            "1.0"
        } else if self.version == Version::HTTP_11 {
            "1.1"
        } else if self.version == Version::HTTP_2 {
            "2"
        } else if self.version == Version::HTTP_3 {
            "3"
        } else {
            "unknown"
        }
    }

    pub fn response_status(&self) -> StatusCode {
        self.response_lock().status
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.response_lock().status = status;
    }

    pub fn append_response_header(&self, name: HeaderName, value: HeaderValue) {
        self.response_lock().headers.append(name, value);
    }

    pub fn response_headers(&self) -> HeaderMap {
        self.response_lock().headers.clone()
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    fn response_lock(&self) -> std::sync::MutexGuard<'_, ResponseRecord> {
        self.response.lock().expect("response record lock poisoned")
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .map(|(name, _)| name)
        .unwrap_or(host)
}

/// The mutable bag attached to a request for cross-hook communication,
/// with one typed slot per concern instead of free-form keys.
#[derive(Default)]
pub struct EventContext {
    trace: Mutex<Option<SpanRecord>>,
    matched_route: Mutex<Option<String>>,
    matched_app_routes: Mutex<HashMap<String, String>>,
}

impl EventContext {
    /// The tracing state for this request, if the request is traced.
    /// The slot is never cleared, even after the span has ended.
    pub fn span_record(&self) -> Option<SpanRecord> {
        self.trace_lock().clone()
    }

    pub(crate) fn set_span_record(&self, record: SpanRecord) {
        *self.trace_lock() = Some(record);
    }

    /// Stamps the handler-completion time onto the span record so the
    /// finalizing hook can close the span at the moment handling
    /// finished rather than when the hook runs.
    pub(crate) fn record_span_end_time(&self, end_time: SystemTime) {
        if let Some(record) = self.trace_lock().as_mut() {
            record.set_end_time(end_time);
        }
    }

    /// The route template matched by the low-level router, available
    /// once the router handler has run.
    pub fn matched_route(&self) -> Option<String> {
        self.matched_route
            .lock()
            .expect("matched route lock poisoned")
            .clone()
    }

    pub fn set_matched_route(&self, route: impl Into<String>) {
        *self
            .matched_route
            .lock()
            .expect("matched route lock poisoned") = Some(route.into());
    }

    /// The application-level matched route recorded by a cooperating
    /// view-layer middleware, keyed by the request path of the render
    /// pass that produced it.
    pub fn matched_app_route(&self, path: &str) -> Option<String> {
        self.matched_app_routes
            .lock()
            .expect("app route lock poisoned")
            .get(path)
            .cloned()
    }

    pub fn set_matched_app_route(&self, path: impl Into<String>, route: impl Into<String>) {
        self.matched_app_routes
            .lock()
            .expect("app route lock poisoned")
            .insert(path.into(), route.into());
    }

    fn trace_lock(&self) -> std::sync::MutexGuard<'_, Option<SpanRecord>> {
        self.trace.lock().expect("trace slot lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_accessors() {
        let event = RequestEvent::new(
            Method::GET,
            "https://example.com:8443/en/hello?param=true".parse().unwrap(),
        );
        assert_eq!(event.path(), "/en/hello");
        assert_eq!(event.query(), Some("param=true"));
        assert_eq!(event.scheme(), "https");
        assert_eq!(event.server_address().as_deref(), Some("example.com"));
        assert_eq!(event.server_port(), Some(8443));
    }

    #[test]
    fn host_header_fallback() {
        let event = RequestEvent::new(Method::GET, "/hello".parse().unwrap())
            .with_header(HOST, "fallback.example:3000".parse().unwrap());
        assert_eq!(event.scheme(), "http");
        assert_eq!(event.server_address().as_deref(), Some("fallback.example"));
        assert_eq!(event.server_port(), None);
    }

    #[test]
    fn forwarded_for_wins_over_peer_address() {
        let event = RequestEvent::new(Method::GET, "/hello".parse().unwrap())
            .with_peer_addr("10.0.0.7:41234".parse().unwrap())
            .with_header(X_FORWARDED_FOR, "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(event.client_address().as_deref(), Some("203.0.113.9"));
        assert_eq!(event.client_port(), Some(41234));
    }

    #[test]
    fn peer_address_without_forwarding() {
        let event = RequestEvent::new(Method::GET, "/hello".parse().unwrap())
            .with_peer_addr("10.0.0.7:41234".parse().unwrap());
        assert_eq!(event.client_address().as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn response_record_defaults_to_ok() {
        let event = RequestEvent::new(Method::GET, "/hello".parse().unwrap());
        assert_eq!(event.response_status(), StatusCode::OK);
        event.set_response_status(StatusCode::NO_CONTENT);
        assert_eq!(event.response_status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn app_routes_are_keyed_by_path() {
        let context = EventContext::default();
        context.set_matched_app_route("/en/hello", "/:locale/hello");
        assert_eq!(
            context.matched_app_route("/en/hello").as_deref(),
            Some("/:locale/hello")
        );
        assert_eq!(context.matched_app_route("/de/hello"), None);
    }
}
