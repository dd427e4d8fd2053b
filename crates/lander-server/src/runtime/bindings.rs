//! JavaScript bindings for lander scripts
//!
//! This module provides the native Rust functions that are exposed to the
//! script. They are installed as globals before the script is evaluated.
//!
//! # JavaScript API
//!
//! - `rest.get(path, handler)`, `rest.post`, `rest.put`, `rest.patch`,
//!   `rest.delete`: register a handler for one verb
//! - `rest.any(path, handler)`: register a handler for all five verbs
//! - `db.query(collection, criteria?)`, `db.insert(collection, record)`,
//!   `db.update(collection, criteria, patch)`, `db.delete(collection, criteria)`
//! - `kv.get(key)`, `kv.set(key, value)`, `kv.delete(key)`, `kv.keys()`
//!
//! Handlers receive the request as a plain object. Header names in
//! `req.headers` are lowercase (`req.headers["content-type"]`).
//! `req.path` and `req.params` are percent-decoded.
//!
//! Handlers are kept in a hidden global array; the route table stores their
//! indices. The engine reads the array back once the script has loaded.
//!
//! The native functions keep their Rust state (store handles and the route
//! registry) in capture structs. None of it holds a garbage-collected
//! pointer, so those fields are skipped by the tracer.

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{builtins::JsArray, FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsError, JsNativeError, JsResult, JsString,
};
use hyper::Method;
use lander_common::{LanderError, Result};
use boa_gc::{Finalize, Trace};
use lander_store::{DocumentStore, KeyValueStore, Record};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::runtime::conversions::{js_error, js_value_to_json, json_to_js_value};
use crate::runtime::routes::{RouteRegistry, ANY_METHODS};
use crate::runtime::Stores;

/// Global holding registered handlers, indexed by the route table.
pub(crate) const HANDLERS_GLOBAL: &str = "__lander_handlers";

/// Install the `rest`, `db` and `kv` globals into the Boa context.
///
/// # Errors
///
/// Returns `LanderError::Build` if a global object or function cannot be
/// created.
pub(crate) fn install_bindings(
    ctx: &mut Context,
    registry: Rc<RefCell<RouteRegistry>>,
    stores: &Stores,
) -> Result<()> {
    let handlers = JsArray::new(ctx);
    ctx.register_global_property(JsString::from(HANDLERS_GLOBAL), handlers, Attribute::empty())
        .map_err(build_error)?;

    install_rest(ctx, registry)?;
    install_db(ctx, stores)?;
    install_kv(ctx, stores)?;
    Ok(())
}

/// Reads back the handler list filled by `rest.*`.
pub(crate) fn take_handlers(ctx: &mut Context) -> Result<Vec<JsObject>> {
    let list = handler_list(ctx).map_err(js_error)?;
    let length: usize = list
        .length(ctx)
        .map_err(js_error)?
        .try_into()
        .map_err(|_| LanderError::Build("handler list is too long".into()))?;

    let mut handlers = Vec::new();
    for i in 0..length {
        let value = list.get(i, ctx).map_err(js_error)?;
        let handler = value
            .as_object()
            .filter(|o| o.is_callable())
            .ok_or_else(|| LanderError::Build(format!("handler #{} is not a function", i)))?;
        handlers.push(handler.clone());
    }
    Ok(handlers)
}

/// State behind one `rest.<verb>` function.
#[derive(Trace, Finalize)]
struct RestCaptures {
    name: String,
    #[unsafe_ignore_trace]
    methods: Vec<Method>,
    #[unsafe_ignore_trace]
    registry: Rc<RefCell<RouteRegistry>>,
}

#[derive(Trace, Finalize)]
struct DocumentCaptures {
    #[unsafe_ignore_trace]
    documents: Arc<DocumentStore>,
}

#[derive(Trace, Finalize)]
struct KvCaptures {
    #[unsafe_ignore_trace]
    kv: Arc<KeyValueStore>,
}

fn install_rest(ctx: &mut Context, registry: Rc<RefCell<RouteRegistry>>) -> Result<()> {
    let rest = JsObject::with_object_proto(ctx.intrinsics());

    let verbs: [(&str, Vec<Method>); 6] = [
        ("get", vec![Method::GET]),
        ("post", vec![Method::POST]),
        ("put", vec![Method::PUT]),
        ("patch", vec![Method::PATCH]),
        ("delete", vec![Method::DELETE]),
        ("any", ANY_METHODS.to_vec()),
    ];

    for (name, methods) in verbs {
        let captures = RestCaptures {
            name: format!("rest.{}", name),
            methods,
            registry: Rc::clone(&registry),
        };
        let function = NativeFunction::from_copy_closure_with_captures(
            |_this, args, rest: &RestCaptures, ctx| {
                let path = string_arg(args, 0, &rest.name)?;
                let handler = args
                    .get(1)
                    .and_then(|v| v.as_object())
                    .filter(|o| o.is_callable())
                    .ok_or_else(|| {
                        type_error(format!("{}: second argument must be a function", rest.name))
                    })?;

                if rest.registry.borrow().is_sealed() {
                    return Err(type_error(format!(
                        "{}: routes can only be registered while the script is loading",
                        rest.name
                    )));
                }

                // The route is registered before its handler is stored, so a
                // rejected route leaves no trace.
                let list = handler_list(ctx)?;
                let index = usize::try_from(list.length(ctx)?)
                    .map_err(|_| type_error("too many handlers"))?;
                rest.registry
                    .borrow_mut()
                    .register(&rest.methods, &path, index)
                    .map_err(|e| type_error(format!("{}: {}", rest.name, e)))?;
                list.push(handler.clone(), ctx)?;

                Ok(JsValue::undefined())
            },
            captures,
        );
        set_function(&rest, name, 2, function, ctx)?;
    }

    ctx.register_global_property(js_string!("rest"), rest, Attribute::all())
        .map_err(build_error)?;
    Ok(())
}

fn install_db(ctx: &mut Context, stores: &Stores) -> Result<()> {
    let db = JsObject::with_object_proto(ctx.intrinsics());
    let captures = || DocumentCaptures {
        documents: Arc::clone(&stores.documents),
    };

    let query = NativeFunction::from_copy_closure_with_captures(
        |_this, args, db: &DocumentCaptures, ctx| {
            let collection = string_arg(args, 0, "db.query")?;
            let criteria = optional_record_arg(args, 1, "db.query", ctx)?;
            let records = db
                .documents
                .query(&collection, &criteria)
                .map_err(|e| store_error("query", e))?;
            let records = JsonValue::Array(records.into_iter().map(JsonValue::Object).collect());
            to_js(&records, ctx)
        },
        captures(),
    );
    set_function(&db, "query", 2, query, ctx)?;

    let insert = NativeFunction::from_copy_closure_with_captures(
        |_this, args, db: &DocumentCaptures, ctx| {
            let collection = string_arg(args, 0, "db.insert")?;
            let record = record_arg(args, 1, "db.insert", ctx)?;
            let stored = db
                .documents
                .insert(&collection, record)
                .map_err(|e| store_error("insert", e))?;
            to_js(&JsonValue::Object(stored), ctx)
        },
        captures(),
    );
    set_function(&db, "insert", 2, insert, ctx)?;

    let update = NativeFunction::from_copy_closure_with_captures(
        |_this, args, db: &DocumentCaptures, ctx| {
            let collection = string_arg(args, 0, "db.update")?;
            let criteria = optional_record_arg(args, 1, "db.update", ctx)?;
            let patch = record_arg(args, 2, "db.update", ctx)?;
            let count = db
                .documents
                .update(&collection, &criteria, &patch)
                .map_err(|e| store_error("update", e))?;
            Ok(JsValue::new(count as f64))
        },
        captures(),
    );
    set_function(&db, "update", 3, update, ctx)?;

    let delete = NativeFunction::from_copy_closure_with_captures(
        |_this, args, db: &DocumentCaptures, ctx| {
            let collection = string_arg(args, 0, "db.delete")?;
            let criteria = optional_record_arg(args, 1, "db.delete", ctx)?;
            let count = db
                .documents
                .delete(&collection, &criteria)
                .map_err(|e| store_error("delete", e))?;
            Ok(JsValue::new(count as f64))
        },
        captures(),
    );
    set_function(&db, "delete", 2, delete, ctx)?;

    ctx.register_global_property(js_string!("db"), db, Attribute::all())
        .map_err(build_error)?;
    Ok(())
}

fn install_kv(ctx: &mut Context, stores: &Stores) -> Result<()> {
    let kv = JsObject::with_object_proto(ctx.intrinsics());
    let captures = || KvCaptures {
        kv: Arc::clone(&stores.kv),
    };

    let get = NativeFunction::from_copy_closure_with_captures(
        |_this, args, store: &KvCaptures, ctx| {
            let key = string_arg(args, 0, "kv.get")?;
            match store.kv.get(&key) {
                Some(value) => to_js(&value, ctx),
                None => Ok(JsValue::null()),
            }
        },
        captures(),
    );
    set_function(&kv, "get", 1, get, ctx)?;

    let set = NativeFunction::from_copy_closure_with_captures(
        |_this, args, store: &KvCaptures, ctx| {
            let key = string_arg(args, 0, "kv.set")?;
            let value = args.get(1).cloned().unwrap_or_else(JsValue::undefined);
            let value = js_value_to_json(&value, ctx)
                .map_err(|e| type_error(format!("kv.set: {}", e)))?;
            store.kv.set(key, value);
            Ok(JsValue::new(true))
        },
        captures(),
    );
    set_function(&kv, "set", 2, set, ctx)?;

    let delete = NativeFunction::from_copy_closure_with_captures(
        |_this, args, store: &KvCaptures, _ctx| {
            let key = string_arg(args, 0, "kv.delete")?;
            Ok(JsValue::new(store.kv.delete(&key)))
        },
        captures(),
    );
    set_function(&kv, "delete", 1, delete, ctx)?;

    let keys = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, store: &KvCaptures, ctx| {
            let keys = store.kv.keys().into_iter().map(JsonValue::String).collect();
            to_js(&JsonValue::Array(keys), ctx)
        },
        captures(),
    );
    set_function(&kv, "keys", 0, keys, ctx)?;

    ctx.register_global_property(js_string!("kv"), kv, Attribute::all())
        .map_err(build_error)?;
    Ok(())
}

fn set_function(
    target: &JsObject,
    name: &str,
    length: usize,
    function: NativeFunction,
    ctx: &mut Context,
) -> Result<()> {
    let function = FunctionObjectBuilder::new(ctx.realm(), function)
        .name(JsString::from(name))
        .length(length)
        .build();
    target
        .set(JsString::from(name), function, false, ctx)
        .map_err(build_error)?;
    Ok(())
}

fn handler_list(ctx: &mut Context) -> JsResult<JsArray> {
    let value = ctx.global_object().get(JsString::from(HANDLERS_GLOBAL), ctx)?;
    let object = value
        .as_object()
        .ok_or_else(|| type_error("handler list is missing"))?;
    JsArray::from_object(object.clone())
}

fn string_arg(args: &[JsValue], index: usize, fn_name: &str) -> JsResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| type_error(format!("{}: argument {} must be a string", fn_name, index + 1)))
}

fn record_arg(args: &[JsValue], index: usize, fn_name: &str, ctx: &mut Context) -> JsResult<Record> {
    let value = args.get(index).cloned().unwrap_or_else(JsValue::undefined);
    match js_value_to_json(&value, ctx).map_err(|e| type_error(format!("{}: {}", fn_name, e)))? {
        JsonValue::Object(record) => Ok(record),
        _ => Err(type_error(format!("{}: argument {} must be an object", fn_name, index + 1))),
    }
}

fn optional_record_arg(
    args: &[JsValue],
    index: usize,
    fn_name: &str,
    ctx: &mut Context,
) -> JsResult<Record> {
    match args.get(index) {
        None => Ok(Record::new()),
        Some(v) if v.is_undefined() || v.is_null() => Ok(Record::new()),
        Some(_) => record_arg(args, index, fn_name, ctx),
    }
}

fn to_js(value: &JsonValue, ctx: &mut Context) -> JsResult<JsValue> {
    json_to_js_value(value, ctx).map_err(|e| JsNativeError::error().with_message(e.to_string()).into())
}

fn type_error(message: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(message.into()).into()
}

fn store_error(op: &str, err: LanderError) -> JsError {
    JsNativeError::error()
        .with_message(format!("db.{} failed: {}", op, err))
        .into()
}

fn build_error(err: JsError) -> LanderError {
    LanderError::Build(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    fn setup() -> (Context, Rc<RefCell<RouteRegistry>>, Stores) {
        let mut ctx = Context::default();
        let registry = Rc::new(RefCell::new(RouteRegistry::new()));
        let stores = Stores::in_memory();
        install_bindings(&mut ctx, Rc::clone(&registry), &stores).unwrap();
        (ctx, registry, stores)
    }

    fn eval_json(ctx: &mut Context, src: &str) -> JsonValue {
        let value = ctx.eval(Source::from_bytes(src)).unwrap();
        js_value_to_json(&value, ctx).unwrap()
    }

    #[test]
    fn test_globals_are_installed() {
        let (mut ctx, _, _) = setup();
        let kinds = eval_json(
            &mut ctx,
            "[typeof rest.get, typeof rest.any, typeof db.query, typeof kv.keys]",
        );
        assert_eq!(kinds, json!(["function", "function", "function", "function"]));
    }

    #[test]
    fn test_rest_registers_routes() {
        let (mut ctx, registry, _) = setup();
        ctx.eval(Source::from_bytes(
            "rest.get('/a', () => 1); rest.any('/b', () => 2);",
        ))
        .unwrap();

        let table = registry.borrow_mut().seal();
        assert_eq!(table.len(), 6);
        assert_eq!(table.lookup(&Method::GET, "/a").unwrap().handler, 0);
        assert_eq!(table.lookup(&Method::DELETE, "/b").unwrap().handler, 1);

        let handlers = take_handlers(&mut ctx).unwrap();
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn test_rest_rejects_bad_arguments() {
        let (mut ctx, _, _) = setup();
        assert!(ctx.eval(Source::from_bytes("rest.get('/a', 42)")).is_err());
        assert!(ctx.eval(Source::from_bytes("rest.get(1, () => 1)")).is_err());
        assert!(ctx.eval(Source::from_bytes("rest.get('nope', () => 1)")).is_err());
    }

    #[test]
    fn test_conflicting_route_throws_type_error() {
        let (mut ctx, _, _) = setup();
        let caught = eval_json(
            &mut ctx,
            r#"
            rest.get('/dup', () => 1);
            let name = null;
            try { rest.get('/dup', () => 2); } catch (e) { name = e.name; }
            name
            "#,
        );
        assert_eq!(caught, json!("TypeError"));
    }

    #[test]
    fn test_rejected_any_leaves_no_handler() {
        let (mut ctx, registry, _) = setup();
        let caught = eval_json(
            &mut ctx,
            r#"
            rest.put('/items', () => 1);
            let name = null;
            try { rest.any('/items', () => 2); } catch (e) { name = e.name; }
            rest.get('/other', () => 3);
            name
            "#,
        );
        assert_eq!(caught, json!("TypeError"));

        let handlers = take_handlers(&mut ctx).unwrap();
        assert_eq!(handlers.len(), 2);

        let table = registry.borrow_mut().seal();
        assert_eq!(table.len(), 2);
        assert!(table.lookup(&Method::GET, "/items").is_none());
        assert_eq!(table.lookup(&Method::PUT, "/items").unwrap().handler, 0);
        assert_eq!(table.lookup(&Method::GET, "/other").unwrap().handler, 1);
    }

    #[test]
    fn test_rest_after_seal_throws() {
        let (mut ctx, registry, _) = setup();
        registry.borrow_mut().seal();
        assert!(ctx.eval(Source::from_bytes("rest.get('/late', () => 1)")).is_err());
    }

    #[test]
    fn test_db_round_trip() {
        let (mut ctx, _, stores) = setup();
        let stored = eval_json(&mut ctx, r#"db.insert("users", {name: "Ada", role: "pilot"})"#);
        assert_eq!(stored, json!({"id": 1, "name": "Ada", "role": "pilot"}));

        let updated = eval_json(&mut ctx, r#"db.update("users", {name: "Ada"}, {role: "commander"})"#);
        assert_eq!(updated, json!(1));

        let found = eval_json(&mut ctx, r#"db.query("users", {role: "commander"})"#);
        assert_eq!(found, json!([{"id": 1, "name": "Ada", "role": "commander"}]));

        let all = eval_json(&mut ctx, r#"db.query("users")"#);
        assert_eq!(all.as_array().unwrap().len(), 1);

        let removed = eval_json(&mut ctx, r#"db.delete("users", {id: 1})"#);
        assert_eq!(removed, json!(1));
        assert!(stores.documents.query("users", &Record::new()).unwrap().is_empty());
    }

    #[test]
    fn test_db_errors_are_catchable() {
        let (mut ctx, _, _) = setup();
        let message = eval_json(
            &mut ctx,
            r#"let m = null; try { db.insert("", {a: 1}); } catch (e) { m = e.message; } m"#,
        );
        assert!(message.as_str().unwrap().starts_with("db.insert failed:"));

        assert!(ctx.eval(Source::from_bytes(r#"db.insert("users", 5)"#)).is_err());
    }

    #[test]
    fn test_kv_operations() {
        let (mut ctx, _, stores) = setup();
        let result = eval_json(
            &mut ctx,
            r#"
            kv.set("b", {n: 1});
            kv.set("a", "x");
            [kv.get("b"), kv.get("missing"), kv.keys(), kv.delete("a"), kv.delete("a")]
            "#,
        );
        assert_eq!(result, json!([{"n": 1}, null, ["a", "b"], true, false]));
        assert_eq!(stores.kv.keys(), vec!["b".to_string()]);
    }
}
