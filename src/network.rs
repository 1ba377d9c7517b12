use regex::Regex;
use serde_json::{Value, json};

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::router::Reply;
use crate::telemetry::NetworkEntry;

/// `network {type?, method?, status?, url?, mime?, minDuration?,
/// minSize?, failed?, body?}` — snapshot the network ring.
///
/// This is the lazy trigger for `Network.enable`: telemetry only flows
/// from the first `network` (or `cookies`) command onward. With
/// `body: <requestId>` the response body for one entry is fetched on
/// demand instead.
pub async fn network(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    ctx.sessions.ensure_domain(session_id, "Network").await?;

    if let Some(request_id) = params["body"].as_str() {
        return fetch_body(ctx, session_id, request_id).await;
    }

    let filter = EntryFilter::from_params(params)?;
    let entries: Vec<NetworkEntry> = ctx
        .network
        .snapshot()
        .into_iter()
        .filter(|e| filter.matches(e))
        .collect();
    let total = entries.len();

    Ok(json!({"entries": entries, "total": total}).into())
}

/// On-demand body fetch for one finalized entry.
async fn fetch_body(
    ctx: &DaemonContext,
    session_id: &str,
    request_id: &str,
) -> Result<Reply, CommandError> {
    let entry = ctx
        .network
        .snapshot()
        .into_iter()
        .find(|e| e.request_id == request_id)
        .ok_or_else(|| CommandError::NotFound(format!("No network entry {request_id}")))?;

    if entry.body.is_some() {
        return Ok(json!({"entry": entry}).into());
    }

    let result = ctx
        .client
        .call(
            Some(session_id),
            "Network.getResponseBody",
            Some(json!({"requestId": request_id})),
            None,
        )
        .await
        .map_err(|e| CommandError::BodyUnavailable(e.to_string()))?;

    let base64 = result["base64Encoded"].as_bool().unwrap_or(false);
    let body = result["body"].as_str().unwrap_or_default();
    let truncated = body.len() > ctx.settings.body_limit;
    let clamped = if truncated {
        let mut end = ctx.settings.body_limit;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        &body[..end]
    } else {
        body
    };

    ctx.network
        .attach_body(request_id, clamped.to_owned(), base64, truncated);

    let mut entry = entry;
    entry.body = Some(clamped.to_owned());
    entry.body_base64 = base64;
    entry.body_truncated = truncated;
    Ok(json!({"entry": entry}).into())
}

/// Parsed `network` filters.
struct EntryFilter {
    resource_type: Option<String>,
    method: Option<String>,
    status: Option<u16>,
    url: Option<Regex>,
    mime: Option<String>,
    min_duration_ms: Option<u64>,
    min_size: Option<u64>,
    failed: Option<bool>,
}

impl EntryFilter {
    fn from_params(params: &Value) -> Result<Self, CommandError> {
        let url = params["url"]
            .as_str()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    CommandError::InvalidArgs(format!("invalid url pattern {pattern:?}: {e}"))
                })
            })
            .transpose()?;

        let status = params["status"]
            .as_u64()
            .map(|s| {
                u16::try_from(s)
                    .map_err(|_| CommandError::InvalidArgs(format!("invalid status {s}")))
            })
            .transpose()?;

        Ok(Self {
            resource_type: params["type"].as_str().map(str::to_lowercase),
            method: params["method"].as_str().map(str::to_uppercase),
            status,
            url,
            mime: params["mime"].as_str().map(str::to_lowercase),
            min_duration_ms: params["minDuration"].as_u64(),
            min_size: params["minSize"].as_u64(),
            failed: params["failed"].as_bool(),
        })
    }

    fn matches(&self, entry: &NetworkEntry) -> bool {
        if let Some(wanted) = &self.resource_type {
            let got = entry.resource_type.as_deref().unwrap_or("").to_lowercase();
            if got != *wanted {
                return false;
            }
        }
        if let Some(wanted) = &self.method {
            if !entry.method.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }
        if let Some(wanted) = self.status {
            if entry.status != Some(wanted) {
                return false;
            }
        }
        if let Some(pattern) = &self.url {
            if !pattern.is_match(&entry.url) {
                return false;
            }
        }
        if let Some(wanted) = &self.mime {
            let got = entry.mime_type.as_deref().unwrap_or("").to_lowercase();
            if !got.contains(wanted) {
                return false;
            }
        }
        if let Some(min) = self.min_duration_ms {
            if entry.duration_ms.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(min) = self.min_size {
            if entry.size < min {
                return false;
            }
        }
        if let Some(failed) = self.failed {
            if entry.failed != failed {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// cookies
// =============================================================================

/// `cookies {action?, ...}` — read, set, or delete cookies.
///
/// `action` defaults to `get`. Get supports `domain` and `name`
/// filters; set needs `name` and `value` plus either `domain` or `url`;
/// delete needs `name` and optionally `domain`/`path`/`url`.
pub async fn cookies(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    ctx.sessions.ensure_domain(session_id, "Network").await?;

    match params["action"].as_str().unwrap_or("get") {
        "get" => get_cookies(ctx, session_id, params).await,
        "set" => set_cookie(ctx, session_id, params).await,
        "delete" => delete_cookies(ctx, session_id, params).await,
        other => Err(CommandError::InvalidArgs(format!(
            "unknown cookies action {other:?} (expected get, set, or delete)"
        ))),
    }
}

async fn get_cookies(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let result = ctx
        .client
        .call(Some(session_id), "Network.getCookies", None, None)
        .await?;

    let domain = params["domain"].as_str();
    let name = params["name"].as_str();

    let cookies: Vec<Value> = result["cookies"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|c| domain.is_none_or(|d| c["domain"].as_str().unwrap_or("").contains(d)))
        .filter(|c| name.is_none_or(|n| c["name"].as_str() == Some(n)))
        .collect();

    let total = cookies.len();
    Ok(json!({"cookies": cookies, "total": total}).into())
}

async fn set_cookie(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let name = params["name"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("cookie name is required".into()))?;
    let value = params["value"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("cookie value is required".into()))?;

    let mut args = json!({"name": name, "value": value});
    for key in ["domain", "path", "url", "sameSite"] {
        if let Some(v) = params[key].as_str() {
            args[key] = json!(v);
        }
    }
    for key in ["secure", "httpOnly"] {
        if let Some(v) = params[key].as_bool() {
            args[key] = json!(v);
        }
    }
    if let Some(expires) = params["expires"].as_f64() {
        args["expires"] = json!(expires);
    }
    if args.get("domain").is_none() && args.get("url").is_none() {
        return Err(CommandError::InvalidArgs(
            "either domain or url is required to set a cookie".into(),
        ));
    }

    let result = ctx
        .client
        .call(Some(session_id), "Network.setCookie", Some(args), None)
        .await?;
    if result["success"].as_bool() == Some(false) {
        return Err(CommandError::InvalidArgs(format!(
            "browser rejected cookie {name:?}"
        )));
    }
    Ok(json!({"set": name}).into())
}

async fn delete_cookies(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let name = params["name"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("cookie name is required".into()))?;

    let mut args = json!({"name": name});
    for key in ["domain", "path", "url"] {
        if let Some(v) = params[key].as_str() {
            args[key] = json!(v);
        }
    }

    ctx.client
        .call(Some(session_id), "Network.deleteCookies", Some(args), None)
        .await?;
    Ok(json!({"deleted": name}).into())
}
