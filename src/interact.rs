use serde_json::{Value, json};

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::js::evaluate_expression;
use crate::router::Reply;

// =============================================================================
// Modifier bitmask (CDP Input domain)
// =============================================================================

const MOD_ALT: u64 = 1;
const MOD_CTRL: u64 = 2;
const MOD_META: u64 = 4;
const MOD_SHIFT: u64 = 8;

fn modifiers_from(params: &Value) -> u64 {
    let mut mask = 0;
    if params["alt"].as_bool().unwrap_or(false) {
        mask |= MOD_ALT;
    }
    if params["ctrl"].as_bool().unwrap_or(false) {
        mask |= MOD_CTRL;
    }
    if params["meta"].as_bool().unwrap_or(false) {
        mask |= MOD_META;
    }
    if params["shift"].as_bool().unwrap_or(false) {
        mask |= MOD_SHIFT;
    }
    mask
}

// =============================================================================
// Key definitions
// =============================================================================

/// `(key, code, text, windowsVirtualKeyCode)` for the keys the daemon
/// dispatches. Printable single characters fall through with themselves
/// as text.
fn key_definition(key: &str) -> Result<(String, String, Option<String>, u64), CommandError> {
    let def = match key {
        "Enter" => ("Enter", "Enter", Some("\r"), 13),
        "Tab" => ("Tab", "Tab", None, 9),
        "Escape" => ("Escape", "Escape", None, 27),
        "Backspace" => ("Backspace", "Backspace", None, 8),
        "Delete" => ("Delete", "Delete", None, 46),
        "ArrowUp" => ("ArrowUp", "ArrowUp", None, 38),
        "ArrowDown" => ("ArrowDown", "ArrowDown", None, 40),
        "ArrowLeft" => ("ArrowLeft", "ArrowLeft", None, 37),
        "ArrowRight" => ("ArrowRight", "ArrowRight", None, 39),
        "Home" => ("Home", "Home", None, 36),
        "End" => ("End", "End", None, 35),
        "PageUp" => ("PageUp", "PageUp", None, 33),
        "PageDown" => ("PageDown", "PageDown", None, 34),
        " " | "Space" => (" ", "Space", Some(" "), 32),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    let code = if c.is_ascii_alphabetic() {
                        format!("Key{}", c.to_ascii_uppercase())
                    } else if c.is_ascii_digit() {
                        format!("Digit{c}")
                    } else {
                        String::new()
                    };
                    let vk = u64::from(c.to_ascii_uppercase() as u32 & 0xff);
                    return Ok((other.to_owned(), code, Some(other.to_owned()), vk));
                }
                _ => {
                    return Err(CommandError::InvalidArgs(format!("unknown key {other:?}")));
                }
            }
        }
    };
    Ok((
        def.0.to_owned(),
        def.1.to_owned(),
        def.2.map(str::to_owned),
        def.3,
    ))
}

/// Dispatch a keyDown/keyUp pair.
async fn press_key(
    ctx: &DaemonContext,
    session_id: &str,
    key: &str,
    modifiers: u64,
) -> Result<(), CommandError> {
    let (key_name, code, text, vk) = key_definition(key)?;

    let mut down = json!({
        "type": "keyDown",
        "key": key_name,
        "code": code,
        "modifiers": modifiers,
        "windowsVirtualKeyCode": vk,
        "nativeVirtualKeyCode": vk,
    });
    if let Some(text) = &text {
        down["text"] = json!(text);
        down["unmodifiedText"] = json!(text);
    }
    ctx.client
        .call(Some(session_id), "Input.dispatchKeyEvent", Some(down), None)
        .await?;

    ctx.client
        .call(
            Some(session_id),
            "Input.dispatchKeyEvent",
            Some(json!({
                "type": "keyUp",
                "key": key_name,
                "code": code,
                "modifiers": modifiers,
                "windowsVirtualKeyCode": vk,
                "nativeVirtualKeyCode": vk,
            })),
            None,
        )
        .await?;
    Ok(())
}

// =============================================================================
// DOM lookup helpers
// =============================================================================

/// Resolve a selector to a node id, or `NotFound`.
async fn query_selector(
    ctx: &DaemonContext,
    session_id: &str,
    selector: &str,
) -> Result<u64, CommandError> {
    if selector.trim().is_empty() {
        return Err(CommandError::InvalidArgs("selector must not be empty".into()));
    }

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

    let result = ctx
        .client
        .call(
            Some(session_id),
            "DOM.querySelector",
            Some(json!({"nodeId": root, "selector": selector})),
            None,
        )
        .await
        .map_err(|e| match e {
            crate::cdp::CdpError::Protocol { message, .. } => {
                CommandError::InvalidArgs(format!("bad selector {selector:?}: {message}"))
            }
            other => other.into(),
        })?;

    match result["nodeId"].as_u64() {
        Some(node_id) if node_id != 0 => Ok(node_id),
        _ => Err(CommandError::NotFound(format!(
            "No element matches {selector:?}"
        ))),
    }
}

fn required_selector<'a>(params: &'a Value) -> Result<&'a str, CommandError> {
    params["selector"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("selector is required".into()))
}

/// Center of a node's content box from `DOM.getBoxModel`.
fn box_center(model: &Value) -> Option<(f64, f64)> {
    let quad = model["model"]["content"].as_array()?;
    let xs: Vec<f64> = quad.iter().step_by(2).filter_map(Value::as_f64).collect();
    let ys: Vec<f64> = quad
        .iter()
        .skip(1)
        .step_by(2)
        .filter_map(Value::as_f64)
        .collect();
    if xs.len() != 4 || ys.len() != 4 {
        return None;
    }
    Some((xs.iter().sum::<f64>() / 4.0, ys.iter().sum::<f64>() / 4.0))
}

// =============================================================================
// click
// =============================================================================

/// `click {selector}` — scroll into view, find the box center, and
/// dispatch a trusted mouse press/release pair. Warns when another
/// element covers the click point.
pub async fn click(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let selector = required_selector(params)?;
    let node_id = query_selector(ctx, session_id, selector).await?;

    // Best effort; a display:none element fails at the box model
    // step with a proper error anyway.
    let _ = ctx
        .client
        .call(
            Some(session_id),
            "DOM.scrollIntoViewIfNeeded",
            Some(json!({"nodeId": node_id})),
            None,
        )
        .await;

    let model = ctx
        .client
        .call(
            Some(session_id),
            "DOM.getBoxModel",
            Some(json!({"nodeId": node_id})),
            None,
        )
        .await
        .map_err(|_| {
            CommandError::NotFound(format!("Element {selector:?} is not visible"))
        })?;

    let (x, y) = box_center(&model)
        .ok_or_else(|| CommandError::NotFound(format!("Element {selector:?} is not visible")))?;

    let warning = overlap_warning(ctx, session_id, selector, x, y).await;

    for event_type in ["mousePressed", "mouseReleased"] {
        ctx.client
            .call(
                Some(session_id),
                "Input.dispatchMouseEvent",
                Some(json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                })),
                None,
            )
            .await?;
    }

    let reply: Reply = json!({"clicked": selector, "x": x, "y": y}).into();
    Ok(match warning {
        Some(warning) => reply.with_warning(warning),
        None => reply,
    })
}

/// Check whether the element at the click point belongs to the target.
async fn overlap_warning(
    ctx: &DaemonContext,
    session_id: &str,
    selector: &str,
    x: f64,
    y: f64,
) -> Option<String> {
    let selector_json = serde_json::to_string(selector).ok()?;
    let expression = format!(
        "(() => {{ const el = document.querySelector({selector_json}); \
         if (!el) return true; \
         const hit = document.elementFromPoint({x}, {y}); \
         return hit === el || el.contains(hit) || (hit && hit.contains(el)); }})()"
    );

    let result = evaluate_expression(ctx, session_id, &expression, false, None)
        .await
        .ok()?;
    if result["result"]["value"].as_bool() == Some(false) {
        Some(format!(
            "element {selector:?} may be overlapped at the click point"
        ))
    } else {
        None
    }
}

// =============================================================================
// focus / type / key
// =============================================================================

/// `focus {selector}`.
pub async fn focus(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let selector = required_selector(params)?;
    let node_id = query_selector(ctx, session_id, selector).await?;

    ctx.client
        .call(
            Some(session_id),
            "DOM.focus",
            Some(json!({"nodeId": node_id})),
            None,
        )
        .await?;
    Ok(json!({"focused": selector}).into())
}

/// `type {selector?, text, clear?, key?}` — insert text into the
/// focused element (optionally focusing a selector first), optionally
/// clearing existing content with Ctrl-A + Backspace and finishing with
/// a key press such as Enter.
pub async fn type_text(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let text = params["text"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("text is required".into()))?;

    if let Some(selector) = params["selector"].as_str() {
        let node_id = query_selector(ctx, session_id, selector).await?;
        ctx.client
            .call(
                Some(session_id),
                "DOM.focus",
                Some(json!({"nodeId": node_id})),
                None,
            )
            .await?;
    }

    if params["clear"].as_bool().unwrap_or(false) {
        press_key(ctx, session_id, "a", MOD_CTRL).await?;
        press_key(ctx, session_id, "Backspace", 0).await?;
    }

    ctx.client
        .call(
            Some(session_id),
            "Input.insertText",
            Some(json!({"text": text})),
            None,
        )
        .await?;

    if let Some(key) = params["key"].as_str() {
        press_key(ctx, session_id, key, 0).await?;
    }

    Ok(json!({"typed": text.chars().count()}).into())
}

/// `key {key, ctrl?, alt?, shift?, meta?}`.
pub async fn key(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let key = params["key"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("key is required".into()))?;
    let modifiers = modifiers_from(params);

    press_key(ctx, session_id, key, modifiers).await?;
    Ok(json!({"pressed": key, "modifiers": modifiers}).into())
}

// =============================================================================
// select / scroll
// =============================================================================

/// `select {selector, value}` — set a native `<select>` value and fire
/// input/change events.
pub async fn select(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let selector = required_selector(params)?;
    let value = params["value"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("value is required".into()))?;

    let selector_json = serde_json::to_string(selector)
        .map_err(|e| CommandError::Internal(e.to_string()))?;
    let value_json =
        serde_json::to_string(value).map_err(|e| CommandError::Internal(e.to_string()))?;

    let expression = format!(
        "(() => {{ const el = document.querySelector({selector_json}); \
         if (!el) return 'missing'; \
         if (el.tagName !== 'SELECT') return 'notselect'; \
         el.value = {value_json}; \
         if (el.value !== {value_json}) return 'nooption'; \
         el.dispatchEvent(new Event('input', {{bubbles: true}})); \
         el.dispatchEvent(new Event('change', {{bubbles: true}})); \
         return 'ok'; }})()"
    );

    let result = evaluate_expression(ctx, session_id, &expression, false, None).await?;
    match result["result"]["value"].as_str() {
        Some("ok") => Ok(json!({"selected": value}).into()),
        Some("missing") => Err(CommandError::NotFound(format!(
            "No element matches {selector:?}"
        ))),
        Some("notselect") => Err(CommandError::InvalidArgs(format!(
            "{selector:?} is not a <select> element"
        ))),
        Some("nooption") => Err(CommandError::NotFound(format!(
            "No option with value {value:?}"
        ))),
        _ => Err(CommandError::Internal("unexpected select result".into())),
    }
}

/// `scroll {selector? | to? | by?}` — scroll an element into view or
/// the window to/by a position. The three forms are mutually exclusive;
/// all scrolling is instant.
pub async fn scroll(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let selector = params["selector"].as_str();
    let to = params.get("to").filter(|v| !v.is_null());
    let by = params.get("by").filter(|v| !v.is_null());

    let mode_count =
        usize::from(selector.is_some()) + usize::from(to.is_some()) + usize::from(by.is_some());
    if mode_count != 1 {
        return Err(CommandError::InvalidArgs(
            "exactly one of selector, to, or by is required".into(),
        ));
    }

    let expression = if let Some(selector) = selector {
        // Probe existence via the DOM domain for a precise error.
        query_selector(ctx, session_id, selector).await?;
        let selector_json = serde_json::to_string(selector)
            .map_err(|e| CommandError::Internal(e.to_string()))?;
        format!(
            "document.querySelector({selector_json})\
             .scrollIntoView({{behavior: 'instant', block: 'center'}})"
        )
    } else if let Some(to) = to {
        let (x, y) = point_from(to, "to")?;
        format!("window.scrollTo({{left: {x}, top: {y}, behavior: 'instant'}})")
    } else {
        let (dx, dy) = point_from(by.unwrap_or(&Value::Null), "by")?;
        format!("window.scrollBy({{left: {dx}, top: {dy}, behavior: 'instant'}})")
    };

    evaluate_expression(ctx, session_id, &expression, false, None).await?;

    let position =
        evaluate_expression(ctx, session_id, "({x: window.scrollX, y: window.scrollY})", false, None)
            .await?;
    let value = &position["result"]["value"];
    Ok(json!({
        "x": value["x"].as_f64().unwrap_or(0.0),
        "y": value["y"].as_f64().unwrap_or(0.0),
    })
    .into())
}

/// Accept `{x, y}` objects or `[x, y]` pairs.
fn point_from(value: &Value, what: &str) -> Result<(f64, f64), CommandError> {
    let pair = match value {
        Value::Array(items) if items.len() == 2 => {
            (items[0].as_f64(), items[1].as_f64())
        }
        Value::Object(_) => (value["x"].as_f64(), value["y"].as_f64()),
        _ => (None, None),
    };
    match pair {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(CommandError::InvalidArgs(format!(
            "{what} needs x and y coordinates"
        ))),
    }
}
