//! JSON <-> JavaScript Value Conversions
//!
//! This module provides bidirectional conversion between `serde_json::Value` and
//! Boa's `JsValue`. Every value that crosses the bridge goes through these two
//! functions:
//!
//! - request views and store results travel JSON → JavaScript
//! - store arguments, `kv` values and JSON response bodies travel JavaScript → JSON
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! # Numbers
//!
//! JavaScript has a single Number type, and so does the bridge: every JSON
//! number becomes a double on the way in. On the way out a double with no
//! fractional part below 2^53 in magnitude is written as a JSON integer, other
//! finite doubles as floats, and NaN or infinities as `null`.
//!
//! # Limitations
//!
//! - Symbol keys in JavaScript objects are skipped
//! - `undefined` becomes JSON null
//! - Functions, symbols and bigints become their string form
//! - Structures nested deeper than [`MAX_DEPTH`] (including cycles) are rejected

use boa_engine::{
    object::builtins::JsArray, object::JsObject, property::PropertyKey, value::JsValue, Context,
    JsError, JsString,
};
use lander_common::{LanderError, Result};
use serde_json::Value as JsonValue;

/// Maximum nesting accepted when converting JavaScript values to JSON.
pub const MAX_DEPTH: usize = 64;

/// 2^53, the first integer a double can no longer tell apart from its neighbour.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Convert serde_json::Value to Boa JsValue.
///
/// # Errors
///
/// Returns `LanderError::Handler` if an array element or object property
/// cannot be created in the context.
///
/// # Examples
///
/// ```ignore
/// let mut ctx = Context::default();
/// let js_value = json_to_js_value(&json!({"name": "test", "value": 42}), &mut ctx)?;
/// ```
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => Ok(JsValue::new(n.as_f64().unwrap_or(f64::NAN))),
        JsonValue::String(s) => Ok(JsValue::new(JsString::from(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    LanderError::Handler(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(JsString::from(key.as_str()), js_value, ctx)
                    .map_err(|e| {
                        LanderError::Handler(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Convert Boa JsValue to serde_json::Value.
///
/// # Conversion Rules
///
/// - `undefined` and `null` → JSON `null`
/// - `Boolean` → JSON `boolean`
/// - `Number` → JSON `number` (see the module docs)
/// - `String` → JSON `string`
/// - `Array` → JSON `array` (recursively converts elements)
/// - `Object` → JSON `object` (skips symbol keys, recursively converts values)
/// - functions, symbols, bigints → JSON `string` of their display form
///
/// # Errors
///
/// Returns `LanderError::Handler` if a property getter throws or the value is
/// nested deeper than [`MAX_DEPTH`].
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    convert(value, ctx, 0)
}

/// Map a JavaScript Number onto the JSON number model.
pub fn number_to_json(n: f64) -> JsonValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return JsonValue::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn convert(value: &JsValue, ctx: &mut Context, depth: usize) -> Result<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(LanderError::Handler(format!(
            "Value is nested more than {} levels deep (cyclic structure?)",
            MAX_DEPTH
        )));
    }

    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(n) = value.as_number() {
        return Ok(number_to_json(n));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Ok(JsonValue::String(value.display().to_string()));
        }

        if obj.is_array() {
            let array = JsArray::from_object(obj.clone()).map_err(js_error)?;
            let length: usize = array
                .length(ctx)
                .map_err(js_error)?
                .try_into()
                .map_err(|_| LanderError::Handler("Array length overflow".into()))?;

            let mut result = Vec::with_capacity(length);
            for i in 0..length {
                let elem = array.get(i, ctx).map_err(|e| {
                    LanderError::Handler(format!("Failed to get array element {}: {}", i, e))
                })?;
                result.push(convert(&elem, ctx, depth + 1)?);
            }
            return Ok(JsonValue::Array(result));
        }

        let keys = obj
            .own_property_keys(ctx)
            .map_err(|e| LanderError::Handler(format!("Failed to get object keys: {}", e)))?;

        let mut result = serde_json::Map::new();
        for key in keys {
            let key_str = match &key {
                PropertyKey::String(s) => s.to_std_string_escaped(),
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };

            let prop_value = obj.get(key.clone(), ctx).map_err(|e| {
                LanderError::Handler(format!("Failed to get property '{}': {}", key_str, e))
            })?;
            result.insert(key_str, convert(&prop_value, ctx, depth + 1)?);
        }
        return Ok(JsonValue::Object(result));
    }

    // Symbols and bigints have no JSON counterpart.
    Ok(JsonValue::String(value.display().to_string()))
}

pub(crate) fn js_error(err: JsError) -> LanderError {
    LanderError::Handler(err.to_string())
}
