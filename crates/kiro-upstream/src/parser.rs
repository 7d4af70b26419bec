//! Frame stream → semantic event stream.
//!
//! One parser task per request. It demuxes frames, reassembles tool-call
//! fragments, extracts thinking spans and bracket-style tool calls from the
//! text, and enforces the first-token watchdog. Events flow to the response
//! translator through a bounded channel; a dropped receiver (client
//! disconnect) stops the parser, which closes the upstream body on drop.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use kiro_core::GatewayError;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::{KiroEvent, SemanticEvent, StopReason};
use crate::frames::FrameDecoder;

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";
/// An unclosed `[tool_call:` longer than this is treated as plain text.
const MAX_BRACKET_HOLDBACK: usize = 2048;

pub struct StreamOptions {
    /// Absolute deadline for the first meaningful token, measured from
    /// request dispatch.
    pub first_token_deadline: Instant,
    /// Mid-stream idle limit, reset on every upstream read.
    pub idle_timeout: Duration,
}

/// Drive a response body through the parser. Errors are only returned while
/// nothing has been forwarded to the client; after the first token everything
/// is reported in-band so the translator can close the stream properly.
pub async fn run_stream(
    resp: reqwest::Response,
    tx: &mpsc::Sender<SemanticEvent>,
    opts: StreamOptions,
) -> Result<(), GatewayError> {
    run_byte_stream(resp.bytes_stream(), tx, opts).await
}

/// Generic over the byte source so tests can feed synthetic streams.
pub async fn run_byte_stream<S, E>(
    mut bytes: S,
    tx: &mpsc::Sender<SemanticEvent>,
    opts: StreamOptions,
) -> Result<(), GatewayError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = FrameDecoder::new();
    let mut demux = TextDemux::new();
    let mut tools = ToolAggregator::new();
    let mut first_token = false;
    let mut saw_tool_use = false;
    let mut context_usage: f64 = 0.0;

    loop {
        let chunk = if first_token {
            match tokio::time::timeout(opts.idle_timeout, bytes.next()).await {
                Ok(item) => item,
                Err(_) => {
                    let _ = tx
                        .send(SemanticEvent::Error {
                            message: format!(
                                "stream idle for {}s",
                                opts.idle_timeout.as_secs()
                            ),
                        })
                        .await;
                    return Ok(());
                }
            }
        } else {
            match tokio::time::timeout_at(opts.first_token_deadline, bytes.next()).await {
                Ok(item) => item,
                Err(_) => {
                    return Err(GatewayError::FirstTokenTimeout {
                        timeout_secs: deadline_secs(opts.first_token_deadline),
                    })
                }
            }
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                if !first_token {
                    return Err(GatewayError::UpstreamTransient(format!(
                        "upstream body error: {e}"
                    )));
                }
                let _ = tx
                    .send(SemanticEvent::Error { message: format!("upstream body error: {e}") })
                    .await;
                return Ok(());
            }
            None => break, // EOF
        };

        decoder.push(&chunk);
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    if !first_token {
                        return Err(e);
                    }
                    let _ = tx.send(SemanticEvent::Error { message: e.to_string() }).await;
                    return Ok(());
                }
            };

            let event = KiroEvent::from_frame(&frame);
            if !first_token && event.is_meaningful() {
                first_token = true;
            }

            match event {
                KiroEvent::AssistantText(text) => {
                    for piece in demux.feed(&text) {
                        if !forward_piece(tx, piece, &mut saw_tool_use).await {
                            return Ok(());
                        }
                    }
                }
                KiroEvent::ToolUseFragment { tool_use_id, name, input, stop } => {
                    if let Some((id, name, args)) = tools.push(tool_use_id, name, input, stop) {
                        saw_tool_use = true;
                        if tx.send(SemanticEvent::ToolUse { id, name, args }).await.is_err() {
                            return Ok(()); // receiver dropped
                        }
                    }
                }
                KiroEvent::Metadata { context_usage: usage } => {
                    if let Some(pct) = usage {
                        context_usage = context_usage.max(pct);
                        if tx.send(SemanticEvent::ContextUsage { percent: pct }).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                KiroEvent::CodeReference => {}
                KiroEvent::UpstreamError { message } => {
                    if !first_token {
                        return Err(GatewayError::UpstreamTransient(message));
                    }
                    let _ = tx.send(SemanticEvent::Error { message }).await;
                    return Ok(());
                }
                KiroEvent::Other { raw } => {
                    debug!(frame = %raw, "dropping unknown upstream event");
                }
            }
        }
    }

    // EOF housekeeping: flush partial text, close dangling tool calls (their
    // args stay exactly as received, possibly cut off mid-JSON).
    for piece in demux.flush() {
        if !forward_piece(tx, piece, &mut saw_tool_use).await {
            return Ok(());
        }
    }
    for (id, name, args) in tools.flush() {
        saw_tool_use = true;
        if tx.send(SemanticEvent::ToolUse { id, name, args }).await.is_err() {
            return Ok(());
        }
    }

    if decoder.pending_bytes() > 0 {
        let err = GatewayError::StreamBroken(format!(
            "short read: {} trailing bytes at end of stream",
            decoder.pending_bytes()
        ));
        if !first_token {
            return Err(err);
        }
        let _ = tx.send(SemanticEvent::Error { message: err.to_string() }).await;
        return Ok(());
    }

    if !first_token {
        return Err(GatewayError::FirstTokenTimeout {
            timeout_secs: deadline_secs(opts.first_token_deadline),
        });
    }

    let stop_reason = if saw_tool_use {
        StopReason::ToolUse
    } else if context_usage >= 100.0 {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    };
    let _ = tx.send(SemanticEvent::StreamEnd { stop_reason }).await;
    Ok(())
}

async fn forward_piece(
    tx: &mpsc::Sender<SemanticEvent>,
    piece: TextPiece,
    saw_tool_use: &mut bool,
) -> bool {
    let event = match piece {
        TextPiece::Content(text) => SemanticEvent::Content { text },
        TextPiece::Thinking(text) => SemanticEvent::Thinking { text },
        TextPiece::BracketTool { name, args } => {
            *saw_tool_use = true;
            SemanticEvent::ToolUse {
                id: format!("toolu_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
                name,
                args,
            }
        }
    };
    tx.send(event).await.is_ok()
}

fn deadline_secs(deadline: Instant) -> u64 {
    // best-effort for the error message; the deadline already passed
    deadline
        .checked_duration_since(Instant::now())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Tool-call fragment aggregation ───────────────────────────────────────────

/// Concatenates `toolUseEvent` fragments per tool-use id in arrival order.
struct ToolAggregator {
    order: Vec<String>,
    open: HashMap<String, (String, String)>, // id -> (name, accumulated args)
}

impl ToolAggregator {
    fn new() -> Self {
        Self { order: Vec::new(), open: HashMap::new() }
    }

    /// Returns the completed call when `stop` closes it.
    fn push(
        &mut self,
        id: String,
        name: String,
        input: String,
        stop: bool,
    ) -> Option<(String, String, String)> {
        let entry = self.open.entry(id.clone()).or_insert_with(|| {
            self.order.push(id.clone());
            (String::new(), String::new())
        });
        if entry.0.is_empty() && !name.is_empty() {
            entry.0 = name;
        }
        entry.1.push_str(&input);

        if stop {
            let (name, args) = self.open.remove(&id)?;
            self.order.retain(|open_id| open_id != &id);
            Some((id, name, args))
        } else {
            None
        }
    }

    /// Calls the stream ended without closing, in arrival order.
    fn flush(&mut self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for id in std::mem::take(&mut self.order) {
            if let Some((name, args)) = self.open.remove(&id) {
                warn!(tool_use_id = %id, "tool call never closed; flushing partial args");
                out.push((id, name, args));
            }
        }
        out
    }
}

// ── Text demux: thinking spans and bracket tool calls ────────────────────────

#[derive(Debug, PartialEq)]
enum TextPiece {
    Content(String),
    Thinking(String),
    BracketTool { name: String, args: String },
}

fn bracket_tool_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[tool_call:\s*([A-Za-z_][\w-]*)\s*\((.*?)\)\s*\]")
            .expect("bracket tool regex compiles")
    })
}

/// Incremental splitter for assistant text. Thinking spans become `Thinking`
/// pieces, complete `[tool_call: name(args)]` spans become `BracketTool`
/// pieces, everything else is `Content`. Potential partial markers at a chunk
/// boundary are held back until resolved.
struct TextDemux {
    buf: String,
    in_thinking: bool,
}

impl TextDemux {
    fn new() -> Self {
        Self { buf: String::new(), in_thinking: false }
    }

    fn feed(&mut self, chunk: &str) -> Vec<TextPiece> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            if self.in_thinking {
                match self.buf.find(THINKING_CLOSE) {
                    Some(idx) => {
                        if idx > 0 {
                            out.push(TextPiece::Thinking(self.buf[..idx].to_string()));
                        }
                        self.buf.drain(..idx + THINKING_CLOSE.len());
                        self.in_thinking = false;
                    }
                    None => {
                        let hold = holdback_len(&self.buf, &[THINKING_CLOSE]);
                        let emit_to = self.buf.len() - hold;
                        if emit_to > 0 {
                            out.push(TextPiece::Thinking(self.buf[..emit_to].to_string()));
                            self.buf.drain(..emit_to);
                        }
                        break;
                    }
                }
                continue;
            }

            let think_at = self.buf.find(THINKING_OPEN);
            let bracket = bracket_tool_re()
                .find(&self.buf)
                .map(|m| (m.start(), m.end()));

            match (think_at, bracket) {
                (Some(t), Some((b_start, _))) if t < b_start => self.enter_thinking(t, &mut out),
                (Some(t), None) => self.enter_thinking(t, &mut out),
                (_, Some((start, end))) => {
                    let (name, args) = {
                        let caps = bracket_tool_re()
                            .captures(&self.buf[start..end])
                            .expect("find matched, captures match");
                        (caps[1].to_string(), caps[2].trim().to_string())
                    };
                    if start > 0 {
                        out.push(TextPiece::Content(self.buf[..start].to_string()));
                    }
                    out.push(TextPiece::BracketTool { name, args });
                    self.buf.drain(..end);
                }
                (None, None) => {
                    let hold = self.normal_holdback();
                    let emit_to = self.buf.len() - hold;
                    if emit_to > 0 {
                        out.push(TextPiece::Content(self.buf[..emit_to].to_string()));
                        self.buf.drain(..emit_to);
                    }
                    break;
                }
            }
        }

        out
    }

    fn enter_thinking(&mut self, at: usize, out: &mut Vec<TextPiece>) {
        if at > 0 {
            out.push(TextPiece::Content(self.buf[..at].to_string()));
        }
        self.buf.drain(..at + THINKING_OPEN.len());
        self.in_thinking = true;
    }

    /// Bytes to hold back in normal mode: an unclosed `[tool_call:` (up to a
    /// sanity cap) or a partial marker prefix at the very end.
    fn normal_holdback(&self) -> usize {
        if let Some(open) = self.buf.rfind("[tool_call:") {
            let span = self.buf.len() - open;
            if span <= MAX_BRACKET_HOLDBACK {
                return span;
            }
        }
        holdback_len(&self.buf, &[THINKING_OPEN, "[tool_call:"])
    }

    fn flush(&mut self) -> Vec<TextPiece> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let text = std::mem::take(&mut self.buf);
        if self.in_thinking {
            vec![TextPiece::Thinking(text)]
        } else {
            vec![TextPiece::Content(text)]
        }
    }
}

/// Longest suffix of `s` that is a proper prefix of any marker.
fn holdback_len(s: &str, markers: &[&str]) -> usize {
    let max_check = markers.iter().map(|m| m.len() - 1).max().unwrap_or(0);
    let start = s.len().saturating_sub(max_check);
    for i in start..s.len() {
        if !s.is_char_boundary(i) {
            continue;
        }
        let suffix = &s[i..];
        if markers.iter().any(|m| m.starts_with(suffix)) {
            return s.len() - i;
        }
    }
    0
}
