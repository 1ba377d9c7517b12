use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;
use url::Url;

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::js::evaluate_expression;
use crate::router::Reply;
use crate::session::NavAbort;

/// Default wait deadline for navigation and `ready`, milliseconds.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// The network must be quiet this long for `ready --network-idle`.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

/// Poll interval for selector, eval, and network-idle waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// URL normalization
// =============================================================================

/// Fill in the scheme for bare hostnames: loopback hosts get `http://`,
/// everything else `https://`.
///
/// # Errors
///
/// Returns `CommandError::InvalidArgs` for unparseable URLs.
pub fn normalize_url(input: &str) -> Result<String, CommandError> {
    let candidate = if input.contains("://") {
        input.to_owned()
    } else {
        let host = input
            .split(['/', ':'])
            .next()
            .unwrap_or(input);
        let scheme = if host == "localhost" || host.starts_with("127.") || host == "0.0.0.0" {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{input}")
    };

    Url::parse(&candidate)
        .map(String::from)
        .map_err(|e| CommandError::InvalidArgs(format!("invalid URL {input:?}: {e}")))
}

// =============================================================================
// navigate / reload / back / forward
// =============================================================================

/// `navigate {url, wait?, timeout?}`.
pub async fn navigate(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let url = params["url"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("url is required".into()))?;
    let wait = params["wait"].as_bool().unwrap_or(false);
    let timeout = wait_timeout(params);
    let normalized = normalize_url(url)?;

    let waiter = ctx.sessions.arm_navigation(session_id, wait)?;
    let started = Instant::now();

    let result = ctx
        .client
        .call(
            Some(session_id),
            "Page.navigate",
            Some(json!({"url": normalized})),
            None,
        )
        .await?;

    if let Some(error_text) = result["errorText"].as_str() {
        if !error_text.is_empty() {
            return Err(CommandError::Cdp {
                method: "Page.navigate".into(),
                code: 0,
                message: error_text.to_owned(),
            });
        }
    }
    if let Some(frame_id) = result["frameId"].as_str() {
        ctx.sessions.set_frame_id(session_id, frame_id);
    }

    if let Some(waiter) = waiter {
        await_load(waiter, timeout).await?;
        let waited = elapsed_ms(started);
        Ok(json!({"url": normalized, "waitedMs": waited}).into())
    } else {
        Ok(json!({"url": normalized}).into())
    }
}

/// `reload {wait?, timeout?, ignoreCache?}`.
pub async fn reload(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let wait = params["wait"].as_bool().unwrap_or(false);
    let timeout = wait_timeout(params);
    let ignore_cache = params["ignoreCache"].as_bool().unwrap_or(false);

    let waiter = ctx.sessions.arm_navigation(session_id, wait)?;
    let started = Instant::now();

    ctx.client
        .call(
            Some(session_id),
            "Page.reload",
            Some(json!({"ignoreCache": ignore_cache})),
            None,
        )
        .await?;

    if let Some(waiter) = waiter {
        await_load(waiter, timeout).await?;
        Ok(json!({"waitedMs": elapsed_ms(started)}).into())
    } else {
        Ok(Value::Null.into())
    }
}

/// History direction for [`history_step`].
#[derive(Debug, Clone, Copy)]
pub enum HistoryDirection {
    Back,
    Forward,
}

/// `back` / `forward {wait?, timeout?}` via the navigation history.
pub async fn history_step(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
    direction: HistoryDirection,
) -> Result<Reply, CommandError> {
    let history = ctx
        .client
        .call(Some(session_id), "Page.getNavigationHistory", None, None)
        .await?;

    let current = usize::try_from(history["currentIndex"].as_u64().unwrap_or(0))
        .map_err(|_| CommandError::Internal("history index out of range".into()))?;
    let entries = history["entries"]
        .as_array()
        .ok_or_else(|| CommandError::Internal("malformed navigation history".into()))?;

    let target_index = match direction {
        HistoryDirection::Back => {
            if current == 0 {
                return Err(CommandError::NotFound("No previous page".into()));
            }
            current - 1
        }
        HistoryDirection::Forward => {
            let next = current + 1;
            if next >= entries.len() {
                return Err(CommandError::NotFound("No next page".into()));
            }
            next
        }
    };

    let entry = &entries[target_index];
    let entry_id = entry["id"].as_i64().unwrap_or(0);
    let entry_url = entry["url"].as_str().unwrap_or_default().to_owned();

    let wait = params["wait"].as_bool().unwrap_or(false);
    let timeout = wait_timeout(params);
    let waiter = ctx.sessions.arm_navigation(session_id, wait)?;

    ctx.client
        .call(
            Some(session_id),
            "Page.navigateToHistoryEntry",
            Some(json!({"entryId": entry_id})),
            None,
        )
        .await?;

    if let Some(waiter) = waiter {
        await_load(waiter, timeout).await?;
    }
    Ok(json!({"url": entry_url}).into())
}

// =============================================================================
// ready
// =============================================================================

/// `ready {selector? | eval? | networkIdle?, timeout?}` — wait until the
/// page reaches a condition. The modes are mutually exclusive; with
/// none given, waits for page load.
pub async fn ready(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let timeout = wait_timeout(params);
    let deadline = Instant::now() + timeout;
    let started = Instant::now();

    let selector = params["selector"].as_str();
    let eval = params["eval"].as_str();
    let network_idle = params["networkIdle"].as_bool().unwrap_or(false);

    let mode_count =
        usize::from(selector.is_some()) + usize::from(eval.is_some()) + usize::from(network_idle);
    if mode_count > 1 {
        return Err(CommandError::InvalidArgs(
            "selector, eval, and networkIdle are mutually exclusive".into(),
        ));
    }

    let mode = if let Some(selector) = selector {
        wait_for_selector(ctx, session_id, selector, deadline).await?;
        "selector"
    } else if let Some(expression) = eval {
        wait_for_truthy(ctx, session_id, expression, deadline).await?;
        "eval"
    } else if network_idle {
        wait_for_network_idle(ctx, session_id, deadline).await?;
        "network-idle"
    } else {
        wait_for_page_load(ctx, session_id, deadline).await?;
        "page-load"
    };

    Ok(json!({"mode": mode, "waitedMs": elapsed_ms(started)}).into())
}

/// Page-load mode: return immediately when the document is already
/// complete, otherwise park on the session's load signal.
async fn wait_for_page_load(
    ctx: &DaemonContext,
    session_id: &str,
    deadline: Instant,
) -> Result<(), CommandError> {
    let signal = ctx.sessions.load_signal(session_id)?;
    // Register before probing so a load firing between the probe and
    // the park is not missed.
    let notified = signal.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    let probe =
        evaluate_expression(ctx, session_id, "document.readyState", false, None).await?;
    if probe["result"]["value"].as_str() == Some("complete") {
        return Ok(());
    }

    tokio::select! {
        () = &mut notified => Ok(()),
        () = tokio::time::sleep_until(deadline) => {
            Err(CommandError::Timeout("ready: page load".into()))
        }
    }
}

/// Selector mode: poll `DOM.querySelector` until it matches.
async fn wait_for_selector(
    ctx: &DaemonContext,
    session_id: &str,
    selector: &str,
    deadline: Instant,
) -> Result<(), CommandError> {
    if selector.trim().is_empty() {
        return Err(CommandError::InvalidArgs("selector must not be empty".into()));
    }

    loop {
        let doc = ctx
            .client
            .call(
                Some(session_id),
                "DOM.getDocument",
                Some(json!({"depth": 0})),
                None,
            )
            .await?;
        let root = doc["root"]["nodeId"].as_u64().unwrap_or(0);

        let found = ctx
            .client
            .call(
                Some(session_id),
                "DOM.querySelector",
                Some(json!({"nodeId": root, "selector": selector})),
                None,
            )
            .await;
        // A malformed selector is an error; "no match yet" is node id 0.
        match found {
            Ok(result) if result["nodeId"].as_u64().unwrap_or(0) != 0 => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(CommandError::InvalidArgs(format!("bad selector: {e}"))),
        }

        if Instant::now() + POLL_INTERVAL >= deadline {
            return Err(CommandError::Timeout(format!("ready: selector {selector:?}")));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Eval mode: poll an expression until it is truthy.
async fn wait_for_truthy(
    ctx: &DaemonContext,
    session_id: &str,
    expression: &str,
    deadline: Instant,
) -> Result<(), CommandError> {
    loop {
        let result = evaluate_expression(ctx, session_id, expression, false, None).await?;
        if is_truthy(&result["result"]) {
            return Ok(());
        }

        if Instant::now() + POLL_INTERVAL >= deadline {
            return Err(CommandError::Timeout("ready: eval".into()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Network-idle mode: no request in flight for the whole idle window.
async fn wait_for_network_idle(
    ctx: &DaemonContext,
    session_id: &str,
    deadline: Instant,
) -> Result<(), CommandError> {
    // Idle tracking needs network telemetry; enable lazily like any
    // other telemetry consumer.
    ctx.sessions.ensure_domain(session_id, "Network").await?;

    loop {
        let (in_flight, quiet_for) = ctx.network.idle_state();
        if in_flight == 0 && quiet_for >= NETWORK_IDLE_WINDOW {
            return Ok(());
        }

        if Instant::now() + POLL_INTERVAL >= deadline {
            return Err(CommandError::Timeout("ready: network idle".into()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// JS truthiness of a CDP `RemoteObject`.
fn is_truthy(result: &Value) -> bool {
    match result["type"].as_str() {
        Some("undefined") => false,
        Some("object") => result["subtype"].as_str() != Some("null"),
        _ => match &result["value"] {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Value::String(s) => !s.is_empty(),
            _ => true,
        },
    }
}

// =============================================================================
// Shared wait plumbing
// =============================================================================

async fn await_load(
    waiter: tokio::sync::oneshot::Receiver<Result<(), NavAbort>>,
    timeout: Duration,
) -> Result<(), CommandError> {
    tokio::select! {
        outcome = waiter => match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(abort)) => Err(abort.into()),
            // Sender dropped: the session went away mid-wait.
            Err(_) => Err(CommandError::Cancelled),
        },
        () = tokio::time::sleep(timeout) => {
            Err(CommandError::Timeout("navigation wait".into()))
        }
    }
}

fn wait_timeout(params: &Value) -> Duration {
    Duration::from_millis(params["timeout"].as_u64().unwrap_or(DEFAULT_WAIT_TIMEOUT_MS))
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hostname_gets_https() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com/");
        assert_eq!(
            normalize_url("example.com/path?q=1").unwrap(),
            "https://example.com/path?q=1"
        );
    }

    #[test]
    fn loopback_hosts_get_http() {
        assert_eq!(normalize_url("localhost").unwrap(), "http://localhost/");
        assert_eq!(
            normalize_url("localhost:3000/app").unwrap(),
            "http://localhost:3000/app"
        );
        assert_eq!(
            normalize_url("127.0.0.1:8080").unwrap(),
            "http://127.0.0.1:8080/"
        );
        assert_eq!(normalize_url("0.0.0.0:80").unwrap(), "http://0.0.0.0/");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        assert_eq!(
            normalize_url("http://example.com").unwrap(),
            "http://example.com/"
        );
        assert_eq!(
            normalize_url("https://localhost/x").unwrap(),
            "https://localhost/x"
        );
    }

    #[test]
    fn garbage_url_is_rejected() {
        assert!(matches!(
            normalize_url("http://"),
            Err(CommandError::InvalidArgs(_))
        ));
    }

    #[test]
    fn truthiness_follows_js_rules() {
        use serde_json::json;
        assert!(!is_truthy(&json!({"type": "undefined"})));
        assert!(!is_truthy(&json!({"type": "object", "subtype": "null", "value": null})));
        assert!(is_truthy(&json!({"type": "object", "className": "Object"})));
        assert!(!is_truthy(&json!({"type": "boolean", "value": false})));
        assert!(is_truthy(&json!({"type": "boolean", "value": true})));
        assert!(!is_truthy(&json!({"type": "number", "value": 0})));
        assert!(is_truthy(&json!({"type": "number", "value": 7})));
        assert!(!is_truthy(&json!({"type": "string", "value": ""})));
        assert!(is_truthy(&json!({"type": "string", "value": "x"})));
    }

    #[test]
    fn default_wait_timeout_applies() {
        assert_eq!(
            wait_timeout(&serde_json::json!({})),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            wait_timeout(&serde_json::json!({"timeout": 500})),
            Duration::from_millis(500)
        );
    }
}
