//! Allow-listed header capture as span attributes.
//!
//! Per the HTTP semantic conventions, header attributes are keyed
//! `http.request.header.<name>` / `http.response.header.<name>` with
//! the name lower-cased, and the value is always an array of strings:
//! one element per header occurrence. Headers absent from the message
//! produce no attribute at all.

use http::HeaderMap;
use opentelemetry::{Array, KeyValue, StringValue, Value};

use crate::runtime::RequestEvent;

const REQUEST_HEADER_PREFIX: &str = "http.request.header.";
const RESPONSE_HEADER_PREFIX: &str = "http.response.header.";

pub(crate) fn request_header_attributes(
    event: &RequestEvent,
    allowlist: &[String],
) -> Vec<KeyValue> {
    header_attributes(event.headers(), allowlist, REQUEST_HEADER_PREFIX)
}

pub(crate) fn response_header_attributes(
    event: &RequestEvent,
    allowlist: &[String],
) -> Vec<KeyValue> {
    header_attributes(&event.response_headers(), allowlist, RESPONSE_HEADER_PREFIX)
}

fn header_attributes(headers: &HeaderMap, allowlist: &[String], prefix: &str) -> Vec<KeyValue> {
    allowlist
        .iter()
        .filter_map(|name| {
            let values = headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(|value| StringValue::from(value.to_owned()))
                .collect::<Vec<_>>();
            if values.is_empty() {
                return None;
            }
            Some(KeyValue::new(
                format!("{prefix}{}", name.to_ascii_lowercase()),
                Value::Array(Array::String(values)),
            ))
        })
        .collect()
}
