use regex::RegexBuilder;
use serde_json::{Value, json};

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::js::evaluate_expression;
use crate::router::Reply;

/// Shortest accepted plain-text `find` query.
const MIN_QUERY_LEN: usize = 3;

/// Default cap on reported `find` matches.
const DEFAULT_FIND_LIMIT: usize = 20;

/// Reported match lines are clipped to this many characters.
const MATCH_LINE_CLIP: usize = 200;

// =============================================================================
// screenshot
// =============================================================================

/// `screenshot {fullPage?}` — capture the page as base64 PNG.
pub async fn screenshot(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let full_page = params["fullPage"].as_bool().unwrap_or(false);

    let mut args = json!({"format": "png"});
    if full_page {
        args["captureBeyondViewport"] = json!(true);
    }

    let result = ctx
        .client
        .call(
            Some(session_id),
            "Page.captureScreenshot",
            Some(args),
            None,
        )
        .await?;

    let data = result["data"]
        .as_str()
        .ok_or_else(|| CommandError::Internal("screenshot response missing data".into()))?;

    Ok(json!({"data": data, "format": "png", "fullPage": full_page}).into())
}

// =============================================================================
// html
// =============================================================================

/// `html {selector?}` — outer HTML of the document or of every element
/// matching a selector.
///
/// The no-selector path is a single `Runtime.evaluate`; right after a
/// navigation this answers fast even while subresources are still
/// loading, whereas DOM-domain traffic can be held behind pending
/// lifecycle work.
pub async fn html(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    match params["selector"].as_str() {
        None => {
            let result = evaluate_expression(
                ctx,
                session_id,
                "document.documentElement.outerHTML",
                false,
                None,
            )
            .await?;
            let html = result["result"]["value"].as_str().unwrap_or_default();
            Ok(json!({"html": html}).into())
        }
        Some(selector) => {
            let node_ids = query_selector_all(ctx, session_id, selector).await?;
            if node_ids.is_empty() {
                return Err(CommandError::NotFound(format!(
                    "No element matches {selector:?}"
                )));
            }

            let mut fragments = Vec::with_capacity(node_ids.len());
            for node_id in &node_ids {
                let outer = ctx
                    .client
                    .call(
                        Some(session_id),
                        "DOM.getOuterHTML",
                        Some(json!({"nodeId": node_id})),
                        None,
                    )
                    .await?;
                if let Some(fragment) = outer["outerHTML"].as_str() {
                    fragments.push(fragment.to_owned());
                }
            }

            let count = fragments.len();
            Ok(json!({"html": fragments.join("\n"), "count": count}).into())
        }
    }
}

/// `DOM.getDocument` + `DOM.querySelectorAll`, returning node ids.
async fn query_selector_all(
    ctx: &DaemonContext,
    session_id: &str,
    selector: &str,
) -> Result<Vec<u64>, CommandError> {
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
            "DOM.querySelectorAll",
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

    Ok(result["nodeIds"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default())
}

// =============================================================================
// find
// =============================================================================

/// `find {text, regex?, caseSensitive?, limit?}` — search the page's
/// outer HTML in the daemon and report line-numbered matches.
pub async fn find(
    ctx: &DaemonContext,
    session_id: &str,
    params: &Value,
) -> Result<Reply, CommandError> {
    let pattern = build_pattern(params)?;
    let limit = params["limit"]
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(DEFAULT_FIND_LIMIT);

    let result = evaluate_expression(
        ctx,
        session_id,
        "document.documentElement.outerHTML",
        false,
        None,
    )
    .await?;
    let html = result["result"]["value"].as_str().unwrap_or_default();

    let mut matches = Vec::new();
    let mut total = 0usize;
    for (index, line) in html.lines().enumerate() {
        if pattern.is_match(line) {
            total += 1;
            if matches.len() < limit {
                matches.push(json!({
                    "line": index + 1,
                    "text": clip(line.trim(), MATCH_LINE_CLIP),
                }));
            }
        }
    }

    Ok(json!({"matches": matches, "total": total}).into())
}

/// Validate `find` arguments and compile the search pattern.
///
/// Plain-text queries must be at least three characters and are
/// case-insensitive unless `caseSensitive` is set. Regex queries bring
/// their own case handling, so combining the two flags is an error.
fn build_pattern(params: &Value) -> Result<regex::Regex, CommandError> {
    let text = params["text"]
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgs("text is required".into()))?;
    let is_regex = params["regex"].as_bool().unwrap_or(false);
    let case_sensitive = params["caseSensitive"].as_bool().unwrap_or(false);

    if is_regex && case_sensitive {
        return Err(CommandError::InvalidArgs(
            "caseSensitive cannot be combined with regex".into(),
        ));
    }

    if is_regex {
        RegexBuilder::new(text)
            .build()
            .map_err(|e| CommandError::InvalidArgs(format!("invalid regex {text:?}: {e}")))
    } else {
        if text.chars().count() < MIN_QUERY_LEN {
            return Err(CommandError::InvalidArgs(format!(
                "query must be at least {MIN_QUERY_LEN} characters"
            )));
        }
        RegexBuilder::new(&regex::escape(text))
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| CommandError::Internal(format!("escaped query failed to compile: {e}")))
    }
}

fn clip(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &line[..byte_index],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_query_is_case_insensitive_by_default() {
        let pattern = build_pattern(&json!({"text": "Sign In"})).unwrap();
        assert!(pattern.is_match("<button>SIGN IN</button>"));
    }

    #[test]
    fn case_sensitive_plain_query() {
        let pattern =
            build_pattern(&json!({"text": "Sign In", "caseSensitive": true})).unwrap();
        assert!(pattern.is_match("<button>Sign In</button>"));
        assert!(!pattern.is_match("<button>sign in</button>"));
    }

    #[test]
    fn plain_query_escapes_regex_metacharacters() {
        let pattern = build_pattern(&json!({"text": "a.b"})).unwrap();
        assert!(pattern.is_match("a.b"));
        assert!(!pattern.is_match("axb"));
    }

    #[test]
    fn short_query_is_rejected() {
        match build_pattern(&json!({"text": "ab"})) {
            Err(CommandError::InvalidArgs(msg)) => {
                assert!(msg.contains("at least 3"));
            }
            other => panic!("expected InvalidArgs, got {other:?}"),
        }
    }

    #[test]
    fn regex_query_compiles() {
        let pattern = build_pattern(&json!({"text": r"data-\w+", "regex": true})).unwrap();
        assert!(pattern.is_match(r#"<div data-user="7">"#));
    }

    #[test]
    fn bad_regex_is_rejected() {
        assert!(matches!(
            build_pattern(&json!({"text": "(", "regex": true})),
            Err(CommandError::InvalidArgs(_))
        ));
    }

    #[test]
    fn regex_with_case_sensitive_is_rejected() {
        assert!(matches!(
            build_pattern(&json!({"text": "x+", "regex": true, "caseSensitive": true})),
            Err(CommandError::InvalidArgs(_))
        ));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("abcdef", 3), "abc");
        assert_eq!(clip("ab", 3), "ab");
        assert_eq!(clip("ééééé", 2), "éé");
    }
}
