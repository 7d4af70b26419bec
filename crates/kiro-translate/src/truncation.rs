//! Truncation-recovery cache.
//!
//! The upstream silently cuts oversized tool arguments and assistant text.
//! When the response translator notices (unparseable tool args, text ending
//! mid-sentence), it records the fact here; on the client's next turn the
//! request translator retrieves the record (exactly once) and injects a
//! synthetic acknowledgement so the model can adapt instead of retrying the
//! same thing forever.
//!
//! In-process only: survives neither restart nor horizontal scaling, which
//! is acceptable for a best-effort mechanism.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use kiro_upstream::StopReason;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Text shorter than this is never flagged as truncated; short replies
/// legitimately end without punctuation.
const MIN_TRUNCATION_LEN: usize = 1024;
const PREVIEW_LEN: usize = 200;
const HASH_PREFIX_CHARS: usize = 500;
const HASH_LEN: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDiagnosis {
    pub size_bytes: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ToolTruncation {
    pub tool_use_id: String,
    pub tool_name: String,
    pub diagnosis: ToolDiagnosis,
    saved_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ContentTruncation {
    pub message_hash: String,
    pub preview: String,
    saved_at: Instant,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub tool_truncations: usize,
    pub content_truncations: usize,
    pub total: usize,
}

/// DashMap keeps each entry under its own shard lock, so concurrent saves
/// and one-shot removes never contend globally.
pub struct TruncationCache {
    tools: DashMap<String, ToolTruncation>,
    contents: DashMap<String, ContentTruncation>,
    ttl: Duration,
}

impl Default for TruncationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TruncationCache {
    pub fn new(ttl: Duration) -> Self {
        Self { tools: DashMap::new(), contents: DashMap::new(), ttl }
    }

    pub fn save_tool_truncation(
        &self,
        tool_use_id: &str,
        tool_name: &str,
        diagnosis: ToolDiagnosis,
    ) {
        self.purge_expired();
        self.tools.insert(
            tool_use_id.to_string(),
            ToolTruncation {
                tool_use_id: tool_use_id.to_string(),
                tool_name: tool_name.to_string(),
                diagnosis,
                saved_at: Instant::now(),
            },
        );
    }

    /// One-shot: the record is removed atomically on read.
    pub fn get_tool_truncation(&self, tool_use_id: &str) -> Option<ToolTruncation> {
        let (_, record) = self.tools.remove(tool_use_id)?;
        (record.saved_at.elapsed() < self.ttl).then_some(record)
    }

    /// Returns the content hash the record was stored under.
    pub fn save_content_truncation(&self, content: &str) -> String {
        self.purge_expired();
        let hash = content_hash(content);
        self.contents.insert(
            hash.clone(),
            ContentTruncation {
                message_hash: hash.clone(),
                preview: content.chars().take(PREVIEW_LEN).collect(),
                saved_at: Instant::now(),
            },
        );
        hash
    }

    pub fn get_content_truncation(&self, content: &str) -> Option<ContentTruncation> {
        let (_, record) = self.contents.remove(&content_hash(content))?;
        (record.saved_at.elapsed() < self.ttl).then_some(record)
    }

    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        let tool_truncations = self.tools.len();
        let content_truncations = self.contents.len();
        CacheStats {
            tool_truncations,
            content_truncations,
            total: tool_truncations + content_truncations,
        }
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.tools.retain(|_, rec| rec.saved_at.elapsed() < ttl);
        self.contents.retain(|_, rec| rec.saved_at.elapsed() < ttl);
    }
}

/// Hash of the first 500 chars, truncated to 16 hex chars. Stable across the
/// tail of the message, which streaming may or may not have delivered.
pub fn content_hash(content: &str) -> String {
    let prefix: String = content.chars().take(HASH_PREFIX_CHARS).collect();
    let digest = Sha256::digest(prefix.as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

// ── Detection ────────────────────────────────────────────────────────────────

/// Unparseable accumulated tool args mean the upstream cut the argument
/// stream. Returns a diagnosis for the cache, or `None` when the args parse.
pub fn diagnose_tool_args(args: &str) -> Option<ToolDiagnosis> {
    if args.is_empty() {
        return Some(ToolDiagnosis {
            size_bytes: 0,
            reason: "empty argument payload".to_string(),
        });
    }
    match serde_json::from_str::<serde_json::Value>(args) {
        Ok(_) => None,
        Err(e) => Some(ToolDiagnosis {
            size_bytes: args.len(),
            reason: format!("argument JSON does not parse: {e}"),
        }),
    }
}

/// A long reply that closed normally, ran no tools, and stopped without
/// terminal punctuation was almost certainly cut by the upstream.
pub fn content_looks_truncated(text: &str, had_tool_use: bool, stop_reason: StopReason) -> bool {
    if had_tool_use || stop_reason != StopReason::EndTurn {
        return false;
    }
    if text.chars().count() < MIN_TRUNCATION_LEN {
        return false;
    }
    let trimmed = text.trim_end();
    !trimmed.ends_with(['.', '!', '?', '"', '\'', '`', ')', ']', '}', ':', '；', '。', '！', '？'])
}

// ── Synthetic recovery messages ──────────────────────────────────────────────

/// Synthetic tool-result body for a truncated tool call. Deliberately
/// universal: it names the cause and asks for adaptation, and never
/// prescribes a particular workaround.
pub fn tool_recovery_text(tool_name: &str, diagnosis: &ToolDiagnosis) -> String {
    format!(
        "[API Limitation] The output of the previous call to '{}' was truncated by the \
         upstream API due to output size limits (about {} bytes arrived; {}). If an error \
         followed, it is likely a consequence of this truncation rather than a mistake in \
         your approach. Avoid repeating the identical call; adapt your approach so the \
         result stays within the output size limits.",
        tool_name, diagnosis.size_bytes, diagnosis.reason
    )
}

/// Synthetic user notice for truncated assistant text. Byte-identical across
/// calls so repeated injections are recognizable.
pub const CONTENT_RECOVERY_NOTICE: &str = "[System Notice] Your previous message was truncated \
by the API due to output size limits before it reached the user. This is not an error on your \
part. Please adapt your response so it completes within the output size limits.";

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnosis() -> ToolDiagnosis {
        ToolDiagnosis { size_bytes: 5000, reason: "missing 2 closing braces".into() }
    }

    #[test]
    fn tool_truncation_is_one_shot() {
        let cache = TruncationCache::default();
        cache.save_tool_truncation("tooluse_abc123", "write_to_file", diagnosis());

        let first = cache.get_tool_truncation("tooluse_abc123").unwrap();
        assert_eq!(first.tool_name, "write_to_file");
        assert_eq!(first.diagnosis.size_bytes, 5000);

        assert!(cache.get_tool_truncation("tooluse_abc123").is_none());
        assert!(cache.get_tool_truncation("never_saved").is_none());
    }

    #[test]
    fn content_truncation_is_one_shot_and_previewed() {
        let cache = TruncationCache::default();
        let content = "x".repeat(5000);
        let hash = cache.save_content_truncation(&content);
        assert_eq!(hash.len(), 16);

        let record = cache.get_content_truncation(&content).unwrap();
        assert_eq!(record.message_hash, hash);
        assert!(record.preview.chars().count() <= 200);

        assert!(cache.get_content_truncation(&content).is_none());
    }

    #[test]
    fn hash_depends_only_on_first_500_chars() {
        let a = "A".repeat(10_000);
        let b = format!("{}{}", "A".repeat(500), "B".repeat(9_500));
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&"C".repeat(600)));
        // deterministic
        assert_eq!(content_hash(&a), content_hash(&a));
    }

    #[test]
    fn expired_records_are_not_returned() {
        let cache = TruncationCache::new(Duration::from_millis(0));
        cache.save_tool_truncation("t", "tool", diagnosis());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_tool_truncation("t").is_none());
    }

    #[test]
    fn stats_track_both_kinds() {
        let cache = TruncationCache::default();
        assert_eq!(cache.stats(), CacheStats { tool_truncations: 0, content_truncations: 0, total: 0 });

        cache.save_tool_truncation("id1", "tool1", diagnosis());
        cache.save_tool_truncation("id2", "tool2", diagnosis());
        cache.save_content_truncation("content1");
        assert_eq!(cache.stats(), CacheStats { tool_truncations: 2, content_truncations: 1, total: 3 });

        cache.get_tool_truncation("id1");
        assert_eq!(cache.stats().total, 2);
    }

    #[test]
    fn concurrent_one_shot_retrieval_returns_each_value_once() {
        use std::sync::Arc;
        let cache = Arc::new(TruncationCache::default());
        let n = 16;
        for i in 0..n {
            cache.save_tool_truncation(&format!("tool_{i}"), &format!("name_{i}"), diagnosis());
        }

        let mut handles = Vec::new();
        for i in 0..n {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.get_tool_truncation(&format!("tool_{i}"))
            }));
        }
        let retrieved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(retrieved.iter().all(Option::is_some));
        assert_eq!(cache.stats().total, 0);
    }

    #[test]
    fn unparseable_args_are_diagnosed() {
        assert!(diagnose_tool_args(r#"{"path":"a.txt","content":"xyz"#).is_some());
        assert!(diagnose_tool_args("").is_some());
        assert!(diagnose_tool_args(r#"{"path":"a.txt"}"#).is_none());
    }

    #[test]
    fn content_truncation_detection_rules() {
        let long_cut = format!("{} because the", "word ".repeat(300));
        assert!(content_looks_truncated(&long_cut, false, StopReason::EndTurn));

        // short text never counts
        assert!(!content_looks_truncated("because the", false, StopReason::EndTurn));
        // terminal punctuation means a clean ending
        let long_done = format!("{}.", "word ".repeat(300));
        assert!(!content_looks_truncated(&long_done, false, StopReason::EndTurn));
        // tool use or an abnormal close is handled elsewhere
        assert!(!content_looks_truncated(&long_cut, true, StopReason::EndTurn));
        assert!(!content_looks_truncated(&long_cut, false, StopReason::MaxTokens));
    }

    #[test]
    fn tool_recovery_text_is_universal() {
        let text = tool_recovery_text("write_to_file", &diagnosis());
        let lower = text.to_lowercase();

        assert!(text.starts_with("[API Limitation]"));
        for required in ["truncated", "upstream api", "output size limits", "consequence",
                         "repeating", "adapt", "likely"] {
            assert!(lower.contains(required), "missing phrase: {required}");
        }
        for forbidden in ["break into smaller", "split the file", "write in chunks",
                          "reduce the size", "make it shorter", "use multiple calls",
                          "split", "break into", "chunk"] {
            assert!(!lower.contains(forbidden), "forbidden phrase present: {forbidden}");
        }
    }

    #[test]
    fn content_recovery_notice_is_deterministic_and_calm() {
        let lower = CONTENT_RECOVERY_NOTICE.to_lowercase();
        assert!(CONTENT_RECOVERY_NOTICE.starts_with("[System Notice]"));
        assert!(lower.contains("truncated"));
        assert!(lower.contains("api"));
        assert!(lower.contains("output size"));
        assert!(lower.contains("not an error on your part"));
        assert!(lower.contains("adapt"));
        for forbidden in ["break into steps", "step by step", "one step at a time",
                          "smaller steps", "incremental"] {
            assert!(!lower.contains(forbidden), "micro-step trigger present: {forbidden}");
        }
    }
}
