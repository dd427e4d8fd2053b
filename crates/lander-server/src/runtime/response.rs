//! Handler return values and their HTTP rendering.
//!
//! A handler returns `[status, body, headers]`; trailing elements may be
//! left out, and a value that is not an array fills the status slot alone.
//! [`ScriptResponse::from_js`] runs on the script worker and produces plain
//! Rust data, which [`ScriptResponse::into_http`] later turns into a hyper
//! response on the connection task.

use boa_engine::{
    object::builtins::{JsArray, JsUint8Array},
    property::PropertyKey,
    value::JsValue,
    js_string, Context,
};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use lander_common::{HyperResponse, LanderError, Result};
use serde_json::Value as JsonValue;

use crate::runtime::conversions::{js_error, js_value_to_json};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";
const APPLICATION_JSON: &str = "application/json";

/// Response body produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl ResponseBody {
    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Empty => None,
            ResponseBody::Text(_) => Some(TEXT_PLAIN),
            ResponseBody::Bytes(_) => Some(OCTET_STREAM),
            ResponseBody::Json(_) => Some(APPLICATION_JSON),
        }
    }

    fn into_bytes(self) -> Result<Bytes> {
        Ok(match self {
            ResponseBody::Empty => Bytes::new(),
            ResponseBody::Text(text) => Bytes::from(text),
            ResponseBody::Bytes(bytes) => Bytes::from(bytes),
            ResponseBody::Json(value) => Bytes::from(serde_json::to_vec(&value)?),
        })
    }
}

/// Marshalled handler result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub status: StatusCode,
    pub body: ResponseBody,
    /// String-valued header entries, in the order the script listed them.
    pub headers: Vec<(String, String)>,
}

impl ScriptResponse {
    /// Reads a handler's return value.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Handler` for a status outside `100..=999` (or not
    /// finite) and for bodies that cannot be converted to JSON.
    pub fn from_js(value: &JsValue, ctx: &mut Context) -> Result<Self> {
        let (status, body, headers) = match value.as_object().filter(|o| o.is_array()) {
            Some(obj) => {
                let tuple = JsArray::from_object(obj.clone()).map_err(js_error)?;
                (
                    tuple.get(0_usize, ctx).map_err(js_error)?,
                    tuple.get(1_usize, ctx).map_err(js_error)?,
                    tuple.get(2_usize, ctx).map_err(js_error)?,
                )
            }
            None => (value.clone(), JsValue::undefined(), JsValue::undefined()),
        };

        Ok(Self {
            status: read_status(&status)?,
            body: read_body(&body, ctx)?,
            headers: read_headers(&headers, ctx)?,
        })
    }

    /// Renders the response, applying script headers before the default
    /// content type.
    pub fn into_http(self) -> Result<HyperResponse> {
        let default_type = self.body.default_content_type();
        let mut response = Response::new(Full::new(self.body.into_bytes()?));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            let parsed = HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(HeaderValue::from_str(&value).ok());
            match parsed {
                Some((name, value)) => {
                    headers.insert(name, value);
                }
                None => tracing::warn!("Dropping invalid response header {:?}: {:?}", name, value),
            }
        }

        if let Some(content_type) = default_type {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }

        Ok(response)
    }
}

fn read_status(value: &JsValue) -> Result<StatusCode> {
    let Some(n) = value.as_number() else {
        return Ok(StatusCode::OK);
    };
    if !n.is_finite() {
        return Err(LanderError::Handler(format!("invalid status code: {}", n)));
    }
    let code = n.trunc();
    if !(100.0..=999.0).contains(&code) {
        return Err(LanderError::Handler(format!("invalid status code: {}", code)));
    }
    StatusCode::from_u16(code as u16)
        .map_err(|e| LanderError::Handler(format!("invalid status code {}: {}", code, e)))
}

fn read_body(value: &JsValue, ctx: &mut Context) -> Result<ResponseBody> {
    if value.is_undefined() || value.is_null() {
        return Ok(ResponseBody::Empty);
    }

    if let Some(s) = value.as_string() {
        return Ok(ResponseBody::Text(s.to_std_string_escaped()));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Ok(ResponseBody::Text(value.display().to_string()));
        }
        if JsUint8Array::from_object(obj.clone()).is_ok() {
            let length = obj.get(js_string!("length"), ctx).map_err(js_error)?;
            let length: usize = length
                .to_length(ctx)
                .map_err(js_error)?
                .try_into()
                .map_err(|_| LanderError::Handler("Byte array length overflow".into()))?;
            let mut bytes = Vec::with_capacity(length);
            for i in 0..length {
                let byte = obj.get(i, ctx).map_err(js_error)?;
                bytes.push(byte.to_number(ctx).map_err(js_error)? as u8);
            }
            return Ok(ResponseBody::Bytes(bytes));
        }
        return Ok(ResponseBody::Json(js_value_to_json(value, ctx)?));
    }

    if value.is_boolean() || value.is_number() {
        return Ok(ResponseBody::Json(js_value_to_json(value, ctx)?));
    }

    Ok(ResponseBody::Text(value.display().to_string()))
}

fn read_headers(value: &JsValue, ctx: &mut Context) -> Result<Vec<(String, String)>> {
    let Some(obj) = value.as_object() else {
        return Ok(Vec::new());
    };

    let mut headers = Vec::new();
    for key in obj.own_property_keys(ctx).map_err(js_error)? {
        let PropertyKey::String(name) = &key else {
            continue;
        };
        let entry = obj.get(key.clone(), ctx).map_err(js_error)?;
        if let Some(value) = entry.as_string() {
            headers.push((name.to_std_string_escaped(), value.to_std_string_escaped()));
        }
    }
    Ok(headers)
}
