//! Script worker for one runtime generation.
//!
//! Boa's `Context` and its garbage collector are bound to the thread that
//! created them, so each generation gets one dedicated OS thread that builds
//! the context, evaluates the script and then serves handler invocations for
//! the rest of its life. Invocations arrive over an unbounded FIFO channel:
//! the channel is the dispatch lock, and jobs run strictly one at a time in
//! arrival order.
//!
//! ```text
//!  connection tasks          script worker thread
//!  ----------------          --------------------
//!  call() ──job──▶ [mpsc] ──▶ handler(view) ──▶ ScriptResponse
//!        ◀────────────── oneshot ────────────────┘
//! ```

use boa_engine::{
    builtins::promise::PromiseState, object::JsObject,
    value::JsValue, Context, JsError, Source,
};
use lander_common::{LanderError, Result};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use crate::runtime::bindings::{install_bindings, take_handlers};
use crate::runtime::conversions::{js_error, json_to_js_value};
use crate::runtime::request::RequestView;
use crate::runtime::response::ScriptResponse;
use crate::runtime::routes::{RouteRegistry, RouteTable};
use crate::runtime::Stores;

/// One queued handler invocation.
struct DispatchJob {
    handler: usize,
    request: RequestView,
    reply: oneshot::Sender<Result<ScriptResponse>>,
}

/// Handle to a running script worker.
pub struct ScriptEngine {
    jobs: Mutex<Option<mpsc::UnboundedSender<DispatchJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptEngine {
    /// Spawns the worker, evaluates `source` on it and waits for the script
    /// to finish loading.
    ///
    /// Returns the engine together with the sealed route table.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Build` if the worker cannot be spawned, the
    /// script throws while loading, or a route registration fails.
    pub async fn start(
        source: String,
        stores: Stores,
        generation: u64,
    ) -> Result<(Self, RouteTable)> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = std::thread::Builder::new()
            .name(format!("lander-script-{}", generation))
            .spawn(move || worker_main(source, stores, ready_tx, jobs_rx))
            .map_err(|e| LanderError::Build(format!("Failed to spawn script worker: {}", e)))?;

        let routes = match ready_rx.await {
            Ok(Ok(routes)) => routes,
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || worker.join()).await;
                return Err(e);
            }
            Err(_) => {
                return Err(LanderError::Build(
                    "Script worker exited before the script finished loading".into(),
                ))
            }
        };

        let engine = Self {
            jobs: Mutex::new(Some(jobs_tx)),
            worker: Mutex::new(Some(worker)),
        };
        Ok((engine, routes))
    }

    /// Queues one handler invocation and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns `LanderError::Handler` if the handler throws, returns an
    /// unusable value, panics, or the worker is no longer running.
    pub async fn call(&self, handler: usize, request: RequestView) -> Result<ScriptResponse> {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| LanderError::Handler("runtime is closed".into()))?;

        let (reply, response) = oneshot::channel();
        sender
            .send(DispatchJob {
                handler,
                request,
                reply,
            })
            .map_err(|_| LanderError::Handler("script worker has stopped".into()))?;

        response
            .await
            .map_err(|_| LanderError::Handler("script worker dropped the request".into()))?
    }

    /// Closes the job queue and joins the worker thread.
    ///
    /// Jobs already queued are still served before the worker exits.
    pub async fn shutdown(&self) {
        drop(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("Script worker panicked during shutdown"),
                Err(e) => tracing::warn!("Failed to join script worker: {}", e),
            }
        }
    }
}

fn worker_main(
    source: String,
    stores: Stores,
    ready: oneshot::Sender<Result<RouteTable>>,
    mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
) {
    let mut ctx = Context::default();

    let handlers = match load_script(&mut ctx, &source, &stores) {
        Ok((routes, handlers)) => {
            if ready.send(Ok(routes)).is_err() {
                return;
            }
            handlers
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(job) = jobs.blocking_recv() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            invoke(&mut ctx, &handlers, job.handler, &job.request)
        }))
        .unwrap_or_else(|panic| {
            Err(LanderError::Handler(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
        // The requester may have gone away; nothing to do then.
        let _ = job.reply.send(result);
    }
}

fn load_script(
    ctx: &mut Context,
    source: &str,
    stores: &Stores,
) -> Result<(RouteTable, Vec<JsObject>)> {
    let registry = Rc::new(RefCell::new(RouteRegistry::new()));
    install_bindings(ctx, Rc::clone(&registry), stores)?;

    ctx.eval(Source::from_bytes(source))
        .map_err(|e| LanderError::Build(format!("Script evaluation error: {}", e)))?;
    ctx.run_jobs()
        .map_err(|e| LanderError::Build(format!("Script job error: {}", e)))?;

    let routes = registry.borrow_mut().seal();
    let handlers = take_handlers(ctx)?;
    Ok((routes, handlers))
}

fn invoke(
    ctx: &mut Context,
    handlers: &[JsObject],
    handler: usize,
    request: &RequestView,
) -> Result<ScriptResponse> {
    let function = handlers
        .get(handler)
        .ok_or_else(|| LanderError::Handler(format!("unknown handler #{}", handler)))?;

    let view = json_to_js_value(&request.to_json()?, ctx)?;
    let result = function
        .call(&JsValue::undefined(), &[view], ctx)
        .map_err(js_error)?;
    let result = settle(result, ctx)?;

    ScriptResponse::from_js(&result, ctx)
}

/// Resolves a promise returned by an async handler by draining the job queue.
fn settle(value: JsValue, ctx: &mut Context) -> Result<JsValue> {
    let Some(promise) = value.as_promise() else {
        return Ok(value);
    };

    ctx.run_jobs().map_err(js_error)?;

    match promise.state() {
        PromiseState::Fulfilled(value) => Ok(value),
        PromiseState::Rejected(reason) => Err(js_error(JsError::from_opaque(reason))),
        PromiseState::Pending => Err(LanderError::Handler(
            "handler returned a promise that never settled".into(),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
