//! Model-info cache.
//!
//! Lazily populated from `ListAvailableModels` with a TTL, single-flight so
//! concurrent misses cause one upstream fetch. When the upstream listing is
//! unreachable the built-in table keeps `/v1/models` and validation working.

use std::collections::HashMap;
use std::time::Duration;

use kiro_core::config::GatewayConfig;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::KiroClient;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_INPUT_TOKENS: u32 = 200_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub max_input_tokens: u32,
    pub supports_tools: bool,
    pub supports_thinking: bool,
}

/// Known upstream models; used until the first successful listing and as a
/// fallback when listing fails.
const BUILTIN_MODELS: &[(&str, u32, bool, bool)] = &[
    ("claude-sonnet-4.5", 200_000, true, true),
    ("claude-sonnet-4", 200_000, true, true),
    ("claude-haiku-4.5", 200_000, true, true),
    ("claude-3-7-sonnet", 200_000, true, true),
];

struct CacheState {
    entries: HashMap<String, ModelInfo>,
    fetched_at: Option<Instant>,
}

pub struct ModelInfoCache {
    state: RwLock<CacheState>,
    fetch_latch: Mutex<()>,
    ttl: Duration,
}

impl Default for ModelInfoCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ModelInfoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState { entries: builtin_entries(), fetched_at: None }),
            fetch_latch: Mutex::new(()),
            ttl,
        }
    }

    /// Refresh from upstream when the TTL has lapsed. Concurrent callers
    /// collapse onto one fetch; failures keep serving the current entries.
    pub async fn ensure_fresh(
        &self,
        client: &KiroClient,
        config: &GatewayConfig,
        auth_header: &str,
        profile_arn: Option<&str>,
    ) {
        if self.is_fresh().await {
            return;
        }

        let _latch = self.fetch_latch.lock().await;
        if self.is_fresh().await {
            return; // another caller fetched while we waited
        }

        match client.list_available_models(config, auth_header, profile_arn).await {
            Ok(models) if !models.is_empty() => {
                let mut entries = HashMap::new();
                for wire in models {
                    let info = ModelInfo {
                        id: wire.model_id.clone(),
                        max_input_tokens: wire
                            .max_input_tokens
                            .unwrap_or(DEFAULT_MAX_INPUT_TOKENS),
                        supports_tools: wire.supports_tools.unwrap_or(true),
                        supports_thinking: wire.supports_thinking.unwrap_or(true),
                    };
                    entries.insert(wire.model_id, info);
                }
                info!(count = entries.len(), "model list refreshed from upstream");
                let mut state = self.state.write().await;
                state.entries = entries;
                state.fetched_at = Some(Instant::now());
            }
            Ok(_) => {
                warn!("upstream returned an empty model list; keeping current entries");
                self.state.write().await.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                warn!(error = %e, "model list fetch failed; keeping current entries");
                // stamp anyway so a flapping upstream isn't hammered
                self.state.write().await.fetched_at = Some(Instant::now());
            }
        }
    }

    pub async fn is_fresh(&self) -> bool {
        match self.state.read().await.fetched_at {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Resolve a client-requested model id, tolerating the common aliases:
    /// date-stamped Anthropic ids and dot/dash version separators.
    pub async fn resolve(&self, requested: &str) -> Option<ModelInfo> {
        let state = self.state.read().await;
        for candidate in candidates(requested) {
            if let Some(info) = state.entries.get(candidate.as_str()) {
                return Some(info.clone());
            }
        }
        None
    }

    pub async fn all(&self) -> Vec<ModelInfo> {
        let state = self.state.read().await;
        let mut models: Vec<ModelInfo> = state.entries.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

fn builtin_entries() -> HashMap<String, ModelInfo> {
    BUILTIN_MODELS
        .iter()
        .map(|(id, max_input, tools, thinking)| {
            (
                id.to_string(),
                ModelInfo {
                    id: id.to_string(),
                    max_input_tokens: *max_input,
                    supports_tools: *tools,
                    supports_thinking: *thinking,
                },
            )
        })
        .collect()
}

/// Alias expansion for a requested model id, most-specific first.
fn candidates(requested: &str) -> Vec<String> {
    let mut out = vec![requested.to_string()];

    // strip a trailing -YYYYMMDD date stamp: claude-sonnet-4-5-20250929
    if let Some(idx) = requested.rfind('-') {
        let (prefix, suffix) = requested.split_at(idx);
        let digits = &suffix[1..];
        if digits.len() == 8 && digits.chars().all(|c| c.is_ascii_digit()) {
            out.push(prefix.to_string());
        }
    }

    // dash/dot version separator variants: claude-sonnet-4-5 <-> claude-sonnet-4.5
    let mut variants = Vec::new();
    for base in &out {
        if let Some(idx) = base.rfind('-') {
            let (prefix, suffix) = base.split_at(idx);
            if suffix[1..].chars().all(|c| c.is_ascii_digit()) && !suffix[1..].is_empty() {
                variants.push(format!("{prefix}.{}", &suffix[1..]));
            }
        }
    }
    out.extend(variants);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_models_resolve_before_any_fetch() {
        let cache = ModelInfoCache::default();
        let info = cache.resolve("claude-haiku-4.5").await.unwrap();
        assert_eq!(info.max_input_tokens, 200_000);
        assert!(info.supports_tools);
    }

    #[tokio::test]
    async fn date_stamped_and_dashed_aliases_resolve() {
        let cache = ModelInfoCache::default();
        assert!(cache.resolve("claude-sonnet-4-5-20250929").await.is_some());
        assert!(cache.resolve("claude-sonnet-4-5").await.is_some());
        assert!(cache.resolve("claude-sonnet-4.5").await.is_some());
    }

    #[tokio::test]
    async fn unknown_model_does_not_resolve() {
        let cache = ModelInfoCache::default();
        assert!(cache.resolve("gpt-4o").await.is_none());
    }

    #[tokio::test]
    async fn all_is_sorted_for_stable_listings() {
        let cache = ModelInfoCache::default();
        let all = cache.all().await;
        let mut sorted = all.clone();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all, sorted);
        assert!(!all.is_empty());
    }

    #[test]
    fn candidate_expansion() {
        assert_eq!(candidates("claude-haiku-4.5"), vec!["claude-haiku-4.5".to_string()]);
        let expanded = candidates("claude-sonnet-4-5-20250929");
        assert!(expanded.contains(&"claude-sonnet-4-5".to_string()));
        assert!(expanded.contains(&"claude-sonnet-4.5".to_string()));
    }
}
