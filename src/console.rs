use serde_json::{Value, json};

use crate::daemon::DaemonContext;
use crate::error::CommandError;
use crate::router::Reply;
use crate::telemetry::{ConsoleEntry, ConsoleLevel};

/// `console {type?, text?, head?, tail?, range?}` — snapshot the
/// console ring with optional filters and slicing. `head`, `tail`, and
/// `range` are mutually exclusive; `range` is a 1-based inclusive
/// `[from, to]` pair over the filtered list.
pub fn console(ctx: &DaemonContext, params: &Value) -> Result<Reply, CommandError> {
    let level = params["type"]
        .as_str()
        .map(|name| {
            ConsoleLevel::parse(name)
                .ok_or_else(|| CommandError::InvalidArgs(format!("unknown console type {name:?}")))
        })
        .transpose()?;
    let text = params["text"].as_str();
    let head = params["head"].as_u64();
    let tail = params["tail"].as_u64();
    let range = parse_range(&params["range"])?;
    let slicers =
        usize::from(head.is_some()) + usize::from(tail.is_some()) + usize::from(range.is_some());
    if slicers > 1 {
        return Err(CommandError::InvalidArgs(
            "head, tail, and range are mutually exclusive".into(),
        ));
    }

    let entries = filter_entries(ctx.console.snapshot(), level, text);
    let total = entries.len();
    let entries = slice_entries(entries, head, tail, range);

    Ok(json!({"entries": entries, "total": total}).into())
}

/// Parse `range: [from, to]`, 1-based inclusive.
fn parse_range(value: &Value) -> Result<Option<(usize, usize)>, CommandError> {
    if value.is_null() {
        return Ok(None);
    }
    let pair = value
        .as_array()
        .filter(|items| items.len() == 2)
        .and_then(|items| Some((items[0].as_u64()?, items[1].as_u64()?)));
    match pair {
        Some((from, to)) if from >= 1 && from <= to => Ok(Some((
            usize::try_from(from).unwrap_or(usize::MAX),
            usize::try_from(to).unwrap_or(usize::MAX),
        ))),
        _ => Err(CommandError::InvalidArgs(
            "range must be [from, to] with 1 <= from <= to".into(),
        )),
    }
}

fn filter_entries(
    entries: Vec<ConsoleEntry>,
    level: Option<ConsoleLevel>,
    text: Option<&str>,
) -> Vec<ConsoleEntry> {
    let needle = text.map(str::to_lowercase);
    entries
        .into_iter()
        .filter(|entry| level.is_none_or(|l| entry.level == l))
        .filter(|entry| {
            needle
                .as_deref()
                .is_none_or(|n| entry.text.to_lowercase().contains(n))
        })
        .collect()
}

fn slice_entries(
    entries: Vec<ConsoleEntry>,
    head: Option<u64>,
    tail: Option<u64>,
    range: Option<(usize, usize)>,
) -> Vec<ConsoleEntry> {
    if let Some(n) = head {
        let n = usize::try_from(n).unwrap_or(usize::MAX);
        entries.into_iter().take(n).collect()
    } else if let Some(n) = tail {
        let n = usize::try_from(n).unwrap_or(usize::MAX);
        let skip = entries.len().saturating_sub(n);
        entries.into_iter().skip(skip).collect()
    } else if let Some((from, to)) = range {
        entries
            .into_iter()
            .skip(from - 1)
            .take(to - from + 1)
            .collect()
    } else {
        entries
    }
}
