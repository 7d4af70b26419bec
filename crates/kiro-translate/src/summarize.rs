//! History summarization for oversized requests.
//!
//! No model call: the summary is a degenerate deterministic digest (first and
//! last sentence of each collapsed turn). The goal is making the request fit
//! the context window, not fidelity; the model can ask again if it needs
//! detail that got squeezed out.

use kiro_core::GatewayError;
use kiro_upstream::envelope::{ConversationEnvelope, HistoryEntry, UserInputMessage};
use tracing::info;

use crate::tokens::{self, ModelFamily};

/// User+assistant pairs preserved verbatim at the tail of the history.
const KEEP_TURNS: usize = 4;
/// Token ceiling for the synthetic summary block.
const SUMMARY_MAX_TOKENS: u32 = 2000;
const MAX_SENTENCES_PER_TURN: usize = 3;

/// Shrink the envelope's history until it fits `budget` tokens. Fails with
/// `ContextOverflow` when the current message alone is over budget.
pub fn shrink_envelope(
    envelope: &mut ConversationEnvelope,
    family: ModelFamily,
    budget: u32,
) -> Result<(), GatewayError> {
    let history = &mut envelope.conversation_state.history;

    // Step 1: collapse everything older than the last KEEP_TURNS pairs into
    // one synthetic user block.
    let keep_entries = KEEP_TURNS * 2;
    if history.len() > keep_entries {
        let preserved = history.split_off(history.len() - keep_entries);
        let collapsed = std::mem::replace(history, preserved);

        // the system preamble rides in the first user message; it must
        // survive the collapse
        let (preamble, summary_source) = extract_system_preamble(&collapsed);
        let mut summary = summarize_entries(&summary_source, family);
        if let Some(preamble) = preamble {
            summary = format!("{preamble}\n\n{summary}");
        }

        let model_id = envelope
            .conversation_state
            .current_message
            .user_input_message
            .model_id
            .clone();
        envelope
            .conversation_state
            .history
            .insert(0, HistoryEntry::UserInputMessage(UserInputMessage::text(summary, model_id)));
        info!(
            collapsed = collapsed.len(),
            "history collapsed into summary block"
        );
    }

    // Step 2: still over budget, so drop preserved turns, oldest first. The
    // summary block at index 0 goes last.
    loop {
        let total = estimate_envelope_tokens(envelope, family);
        if total <= budget {
            return Ok(());
        }
        let history = &mut envelope.conversation_state.history;
        if history.len() > 1 {
            history.remove(1);
        } else if !history.is_empty() {
            history.clear();
        } else {
            return Err(GatewayError::ContextOverflow(format!(
                "the latest message alone needs {total} tokens of a {budget} token budget"
            )));
        }
    }
}

/// Rough token size of a built envelope; mirrors the accountant's rules over
/// the upstream shapes.
pub fn estimate_envelope_tokens(envelope: &ConversationEnvelope, family: ModelFamily) -> u32 {
    let mut total: u32 = 3;
    for entry in &envelope.conversation_state.history {
        total = total.saturating_add(4).saturating_add(entry_tokens(entry, family));
    }
    let current = &envelope.conversation_state.current_message.user_input_message;
    total = total
        .saturating_add(4)
        .saturating_add(user_tokens(current, family));
    for tool in &current.user_input_message_context.tools {
        total = total.saturating_add(tokens::count_text(
            &serde_json::to_string(&tool).unwrap_or_default(),
            family,
        ));
    }
    total
}

fn entry_tokens(entry: &HistoryEntry, family: ModelFamily) -> u32 {
    match entry {
        HistoryEntry::UserInputMessage(msg) => user_tokens(msg, family),
        HistoryEntry::AssistantResponseMessage(msg) => {
            let mut total = tokens::count_text(&msg.content, family);
            for tool_use in &msg.tool_uses {
                total = total
                    .saturating_add(tokens::count_text(&tool_use.name, family))
                    .saturating_add(tokens::count_text(&tool_use.input.to_string(), family));
            }
            total
        }
    }
}

fn user_tokens(msg: &UserInputMessage, family: ModelFamily) -> u32 {
    let mut total = tokens::count_text(&msg.content, family);
    for result in &msg.user_input_message_context.tool_results {
        for content in &result.content {
            total = total.saturating_add(tokens::count_text(&content.text, family));
        }
    }
    for image in &msg.images {
        total = total.saturating_add(((image.source.bytes.len() as f64) * 0.001) as u32 + 85);
    }
    total
}

/// Split a leading `<system>...</system>` span off the first user entry so
/// it can be re-attached ahead of the summary.
fn extract_system_preamble(entries: &[HistoryEntry]) -> (Option<String>, Vec<HistoryEntry>) {
    let mut entries = entries.to_vec();
    let preamble = entries.iter_mut().find_map(|entry| {
        let HistoryEntry::UserInputMessage(msg) = entry else {
            return None;
        };
        if !msg.content.starts_with("<system>") {
            return None;
        }
        let close = msg.content.find("</system>")?;
        let end = close + "</system>".len();
        let preamble = msg.content[..end].to_string();
        msg.content = msg.content[end..].trim_start().to_string();
        Some(preamble)
    });
    (preamble, entries)
}

fn summarize_entries(entries: &[HistoryEntry], family: ModelFamily) -> String {
    let mut bullets = Vec::new();
    for entry in entries {
        let (label, text) = match entry {
            HistoryEntry::UserInputMessage(msg) => ("user", msg.content.as_str()),
            HistoryEntry::AssistantResponseMessage(msg) => ("assistant", msg.content.as_str()),
        };
        let digest = first_and_last_sentences(text);
        if !digest.is_empty() {
            bullets.push(format!("- {label}: {digest}"));
        }
    }

    let mut summary = format!("[Summary of earlier turns:\n{}]", bullets.join("\n"));

    // hard token ceiling; chop bullets from the middle until under
    while tokens::count_text(&summary, family) > SUMMARY_MAX_TOKENS && bullets.len() > 1 {
        bullets.remove(bullets.len() / 2);
        summary = format!("[Summary of earlier turns:\n{}]", bullets.join("\n"));
    }
    if tokens::count_text(&summary, family) > SUMMARY_MAX_TOKENS {
        let cap = (SUMMARY_MAX_TOKENS as usize) * 4;
        summary = summary.chars().take(cap).collect::<String>() + "]";
    }
    summary
}

/// First and last sentence of a turn, capped at MAX_SENTENCES_PER_TURN total.
fn first_and_last_sentences(text: &str) -> String {
    let sentences: Vec<&str> = split_sentences(text);
    match sentences.len() {
        0 => String::new(),
        1 => sentences[0].to_string(),
        2 => format!("{} {}", sentences[0], sentences[1]),
        _ if MAX_SENTENCES_PER_TURN >= 3 => {
            format!("{} [...] {}", sentences[0], sentences[sentences.len() - 1])
        }
        _ => sentences[0].to_string(),
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?' | b'\n') {
            let end = i + 1;
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
