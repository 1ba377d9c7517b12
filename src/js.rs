use std::time::Duration;

use serde_json::{Value, json};

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::router::Reply;

/// Run an expression in the page and return the raw CDP result object.
///
/// `returnByValue` is always set so results arrive as plain JSON.
/// Exceptions surface as `CommandError::Js`.
pub(crate) async fn evaluate_expression(
    ctx: &DaemonContext,
    session_id: &str,
    expression: &str,
    await_promise: bool,
    timeout: Option<Duration>,
) -> Result<Value, CommandError> {
    let result = ctx
        .client
        .call(
            Some(session_id),
            "Runtime.evaluate",
            Some(json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": await_promise,
            })),
            timeout,
        )
        .await?;

    if let Some(details) = result.get("exceptionDetails") {
        return Err(CommandError::Js(exception_text(details)));
    }
    Ok(result)
}

/// `eval {expr, timeout?}` — evaluate JavaScript and return its value.
///
/// The response is `{value, type}`: `type` carries the JS type so the
/// client can tell `undefined` (`{value: null, type: "undefined"}`)
/// from an actual `null` (`{value: null, type: "object"}`).
pub async fn eval(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let expression = params["expr"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("expr is required".into()))?;
    let timeout = params["timeout"].as_u64().map(Duration::from_millis);

    let result = evaluate_expression(ctx, session_id, expression, true, timeout).await?;
    let remote = &result["result"];

    Ok(json!({
        "value": remote.get("value").cloned().unwrap_or(Value::Null),
        "type": remote["type"].as_str().unwrap_or("undefined"),
    })
    .into())
}

/// Best human-readable text for a CDP `exceptionDetails` object.
fn exception_text(details: &Value) -> String {
    details["exception"]["description"]
        .as_str()
        .or_else(|| details["exception"]["value"].as_str())
        .or_else(|| details["text"].as_str())
        .unwrap_or("unknown JavaScript error")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_text_prefers_description() {
        let details = json!({
            "text": "Uncaught",
            "exception": {"description": "ReferenceError: nope is not defined"}
        });
        assert_eq!(
            exception_text(&details),
            "ReferenceError: nope is not defined"
        );
    }

    #[test]
    fn exception_text_falls_back_to_text() {
        let details = json!({"text": "Uncaught SyntaxError"});
        assert_eq!(exception_text(&details), "Uncaught SyntaxError");
    }

    #[test]
    fn exception_text_handles_thrown_strings() {
        let details = json!({"exception": {"type": "string", "value": "boom"}});
        assert_eq!(exception_text(&details), "boom");
    }
}
