//! The request view handed to script handlers.

use hyper::body::Bytes;
use hyper::{HeaderMap, Method, Uri};
use lander_common::Result;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// A header or query parameter: a string when it arrived once, a list when it
/// arrived more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    One(String),
    Many(Vec<String>),
}

impl FieldValue {
    fn push(&mut self, value: String) {
        match self {
            FieldValue::One(first) => {
                let first = std::mem::take(first);
                *self = FieldValue::Many(vec![first, value]);
            }
            FieldValue::Many(values) => values.push(value),
        }
    }
}

/// Read-only projection of an inbound request.
///
/// Serializes to the object scripts receive as their only argument:
/// `{ method, path, rawQuery, body, clientIp, headers, query, params }`.
/// Header names are lowercase, as the HTTP layer delivers them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    pub body: String,
    pub client_ip: String,
    pub headers: BTreeMap<String, FieldValue>,
    pub query: BTreeMap<String, FieldValue>,
    pub params: BTreeMap<String, String>,
}

impl RequestView {
    /// Builds the view from the parts of a request whose body has already
    /// been collected.
    pub fn new(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Bytes,
        remote_addr: Option<SocketAddr>,
        params: Vec<(String, String)>,
    ) -> Self {
        let raw_query = uri.query().unwrap_or_default().to_string();

        let headers = collect_fields(headers.iter().map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        }));

        let query = collect_fields(
            url::form_urlencoded::parse(raw_query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );

        Self {
            method: method.as_str().to_string(),
            path: decoded_path(uri),
            raw_query,
            body: String::from_utf8_lossy(body).into_owned(),
            client_ip: remote_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
            headers,
            query,
            params: params.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The request path with percent-escapes decoded. Routing and the view both
/// use this form; invalid UTF-8 is replaced.
pub fn decoded_path(uri: &Uri) -> String {
    percent_decode_str(uri.path()).decode_utf8_lossy().into_owned()
}

fn collect_fields(pairs: impl Iterator<Item = (String, String)>) -> BTreeMap<String, FieldValue> {
    let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
    for (key, value) in pairs {
        match fields.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                fields.insert(key, FieldValue::One(value));
            }
        }
    }
    fields
}
