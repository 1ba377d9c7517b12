use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::console;
use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::interact;
use crate::ipc::{IpcRequest, IpcResponse};
use crate::js;
use crate::navigate::{self, HistoryDirection};
use crate::network;
use crate::page;

/// A successful command result: the `data` payload plus an optional
/// non-fatal warning surfaced next to it on the wire.
pub struct Reply {
    pub data: Value,
    pub warning: Option<String>,
}

impl Reply {
    #[must_use]
    pub fn with_warning(mut self, warning: String) -> Self {
        self.warning = Some(warning);
        self
    }
}

impl From<Value> for Reply {
    fn from(data: Value) -> Self {
        Self {
            data,
            warning: None,
        }
    }
}

/// Maps the stable command vocabulary onto CDP call sequences.
///
/// The router owns the preconditions: commands that talk to a page
/// resolve their session (explicit `target` or the active session)
/// before their handler runs; `status`, `shutdown`, `clear`, `target`,
/// and `console` work without one.
pub struct Router {
    ctx: Arc<DaemonContext>,
}

impl Router {
    #[must_use]
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    /// Turn one request into one response. Never panics, never skips a
    /// response: every error becomes `{ok:false, error}`.
    pub async fn dispatch(&self, request: IpcRequest) -> IpcResponse {
        debug!(cmd = %request.cmd, target = ?request.target, "command");
        match self.route(&request).await {
            Ok(reply) => match reply.warning {
                Some(warning) => IpcResponse::success_with_warning(reply.data, warning),
                None => IpcResponse::success(reply.data),
            },
            Err(error) => IpcResponse::failure(error),
        }
    }

    async fn route(&self, request: &IpcRequest) -> Result<Reply, CommandError> {
        let ctx = &*self.ctx;
        let params = &request.params;

        // Commands that run without a session.
        match request.cmd.as_str() {
            "status" => return Ok(self.status()),
            "shutdown" => {
                ctx.request_shutdown();
                return Ok(Value::Null.into());
            }
            "clear" => return clear(ctx, params),
            "target" => return target(ctx, params),
            "console" => return console::console(ctx, params),
            _ => {}
        }

        // Everything else needs a browser session.
        let session_id = ctx.sessions.resolve(request.target.as_deref())?;
        match request.cmd.as_str() {
            "navigate" => navigate::navigate(ctx, &session_id, params).await,
            "reload" => navigate::reload(ctx, &session_id, params).await,
            "back" => {
                navigate::history_step(ctx, &session_id, params, HistoryDirection::Back).await
            }
            "forward" => {
                navigate::history_step(ctx, &session_id, params, HistoryDirection::Forward).await
            }
            "ready" => navigate::ready(ctx, &session_id, params).await,
            "network" => network::network(ctx, &session_id, params).await,
            "cookies" => network::cookies(ctx, &session_id, params).await,
            "screenshot" => page::screenshot(ctx, &session_id, params).await,
            "html" => page::html(ctx, &session_id, params).await,
            "find" => page::find(ctx, &session_id, params).await,
            "eval" => js::eval(ctx, &session_id, params).await,
            "click" => interact::click(ctx, &session_id, params).await,
            "focus" => interact::focus(ctx, &session_id, params).await,
            "type" => interact::type_text(ctx, &session_id, params).await,
            "key" => interact::key(ctx, &session_id, params).await,
            "select" => interact::select(ctx, &session_id, params).await,
            "scroll" => interact::scroll(ctx, &session_id, params).await,
            unknown => Err(CommandError::InvalidArgs(format!(
                "unknown command {unknown:?}"
            ))),
        }
    }

    fn status(&self) -> Reply {
        let ctx = &self.ctx;
        json!({
            "running": true,
            "pid": std::process::id(),
            "uptimeMs": u64::try_from(ctx.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "activeSession": ctx.sessions.active_session(),
            "sessions": ctx.sessions.list(),
            "consoleEntries": ctx.console.len(),
            "networkEntries": ctx.network.len(),
        })
        .into()
    }
}

/// `clear {target?}` — reset the console ring, the network ring, or
/// both (the default).
fn clear(ctx: &DaemonContext, params: &Value) -> Result<Reply, CommandError> {
    let which = params["target"].as_str().unwrap_or("both");
    match which {
        "console" => ctx.console.clear(),
        "network" => ctx.network.clear(),
        "both" => {
            ctx.console.clear();
            ctx.network.clear();
        }
        other => {
            return Err(CommandError::InvalidArgs(format!(
                "invalid clear target {other:?} (expected console, network, or both)"
            )));
        }
    }
    Ok(json!({"cleared": which}).into())
}

/// `target {query?}` — list sessions, or switch the active one to the
/// unique session matching the query.
fn target(ctx: &DaemonContext, params: &Value) -> Result<Reply, CommandError> {
    match params["query"].as_str() {
        None => Ok(json!({
            "sessions": ctx.sessions.list(),
            "activeSession": ctx.sessions.active_session(),
        })
        .into()),
        Some(query) => {
            let info = ctx.sessions.switch_active(query)?;
            Ok(json!({"activeSession": info}).into())
        }
    }
}
