//! Text prediction -> structured actions.
//!
//! Understands the UI-TARS response layout:
//!
//! ```text
//! Thought: the search box is at the top
//! Action: click(start_box='<|box_start|>(235,512)<|box_end|>')
//! ```
//!
//! or, for reflective models, `Reflection: … Action_Summary: … Action: …`.
//! Several actions may follow `Action:`, separated by blank lines. Box
//! arguments are emitted by the model on the factor grid and are normalized
//! here to `"[x1,y1,x2,y2]"` in `0..=1`.
use std::sync::OnceLock;

use regex::Regex;

use crate::agent_engine::state::{Factors, ParsedAction};
use crate::errors::{PilotError, PilotResult};
use crate::perception::types::ScreenContext;

const BOX_KEYS: [&str; 3] = ["start_box", "end_box", "point"];

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").expect("valid regex"))
}

fn arg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:'([^']*)'|"([^"]*)")"#).expect("valid regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"))
}

/// Parse every action in `prediction`.
///
/// A prediction without an `Action:` section yields no actions.
pub fn parse(
    prediction: &str,
    factors: Factors,
    screen_context: ScreenContext,
    scale_factor: f64,
) -> PilotResult<Vec<ParsedAction>> {
    let text = prediction.trim();
    let (reflection, thought) = extract_thought(text);

    let Some(idx) = action_section_start(text) else {
        tracing::debug!(len = text.len(), "prediction has no Action section");
        return Ok(Vec::new());
    };
    let action_section = &text[idx + "Action:".len()..];

    let mut actions = Vec::new();
    for raw in action_section.split("\n\n").map(str::trim).filter(|s| !s.is_empty()) {
        let mut action = parse_call(raw, factors)?;
        action.thought = thought.clone();
        action.reflection = reflection.clone();
        actions.push(action);
    }

    tracing::debug!(
        count = actions.len(),
        types = ?actions.iter().map(|a| a.action_type.as_str()).collect::<Vec<_>>(),
        screen = %format!("{}x{}", screen_context.width, screen_context.height),
        scale_factor,
        "prediction parsed"
    );
    Ok(actions)
}

/// Offset of the first `Action:` that begins a line. Argument text may
/// itself contain `Action:`, so later occurrences are never section markers.
fn action_section_start(text: &str) -> Option<usize> {
    if text.starts_with("Action:") {
        return Some(0);
    }
    text.find("\nAction:").map(|i| i + 1)
}

/// Returns `(reflection, thought)`.
fn extract_thought(text: &str) -> (Option<String>, String) {
    let action_at = action_section_start(text).unwrap_or(text.len());

    if let Some(t) = text.find("Thought:") {
        let start = t + "Thought:".len();
        let end = action_at.max(start);
        return (None, text[start..end].trim().to_string());
    }

    if let Some(r) = text.find("Reflection:") {
        let r_start = r + "Reflection:".len();
        let summary_at = text[r_start..].find("Action_Summary:").map(|i| i + r_start);
        let r_end = summary_at.unwrap_or(action_at).max(r_start);
        let reflection = text[r_start..r_end].trim().to_string();
        let thought = summary_at
            .map(|s| {
                let start = s + "Action_Summary:".len();
                text[start..action_at.max(start)].trim().to_string()
            })
            .unwrap_or_default();
        return (Some(reflection), thought);
    }

    if let Some(s) = text.find("Action_Summary:") {
        let start = s + "Action_Summary:".len();
        return (None, text[start..action_at.max(start)].trim().to_string());
    }

    (None, String::new())
}

fn parse_call(raw: &str, factors: Factors) -> PilotResult<ParsedAction> {
    // Models sometimes append a trailing comment or quote noise after the call.
    let first_line_call = raw.lines().next().unwrap_or(raw);
    let caps = call_re()
        .captures(raw)
        .or_else(|| call_re().captures(first_line_call))
        .ok_or_else(|| PilotError::Parse(format!("not a function call: {raw}")))?;

    let name = caps[1].to_string();
    let args = caps.get(2).map_or("", |m| m.as_str());
    let mut action = ParsedAction::new(name);

    // `content` may legitimately contain quotes; take it up to the last quote.
    let mut rest = args.to_string();
    if let Some(pos) = args.find("content=") {
        let value = args[pos + "content=".len()..].trim();
        if let Some(quote) = value.chars().next().filter(|c| *c == '\'' || *c == '"') {
            let inner = &value[1..];
            let end = inner.rfind(quote).unwrap_or(inner.len());
            action.action_inputs.insert("content".into(), inner[..end].to_string());
            rest = args[..pos].to_string();
        }
    }

    for cap in arg_re().captures_iter(&rest) {
        let key = cap[1].to_string();
        let value = cap.get(2).or_else(|| cap.get(3)).map_or("", |m| m.as_str());
        let value = if BOX_KEYS.contains(&key.as_str()) {
            normalize_box(value, factors)?
        } else {
            value.to_string()
        };
        let key = if key == "point" { "start_box".to_string() } else { key };
        action.action_inputs.insert(key, value);
    }

    Ok(action)
}

/// `"<|box_start|>(235,512)<|box_end|>"` -> `"[0.235,0.512,0.235,0.512]"`.
fn normalize_box(raw: &str, factors: Factors) -> PilotResult<String> {
    let nums: Vec<f64> = number_re()
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();

    let coords: Vec<f64> = match nums.as_slice() {
        [x, y] => vec![*x, *y, *x, *y],
        [x1, y1, x2, y2] => vec![*x1, *y1, *x2, *y2],
        _ => return Err(PilotError::Parse(format!("bad box: {raw}"))),
    };

    let normalized: Vec<String> = coords
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let factor = if i % 2 == 0 { factors.width() } else { factors.height() };
            (v / factor).to_string()
        })
        .collect();
    Ok(format!("[{}]", normalized.join(",")))
}

/// Drop `Reflection:` blocks, keeping the part of a prediction worth showing.
pub fn strip_reflection(prediction: &str) -> String {
    let mut out = prediction.to_string();
    while let Some(start) = out.find("Reflection:") {
        let after = start + "Reflection:".len();
        let end = ["Action_Summary:", "Action:"]
            .iter()
            .filter_map(|m| out[after..].find(m).map(|i| i + after))
            .min()
            .unwrap_or(out.len());
        out.replace_range(start..end, "");
    }
    out.trim().to_string()
}
