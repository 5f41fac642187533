//! Embedder adapter contract (spec §4.2): turns text into a finite,
//! L2-normalized float vector, or `None` when no embedding is available.
//!
//! Mirrors the teacher's `Tokenizer` trait shape: a `Send + Sync` trait
//! object behind `Arc<dyn Embedder>` so the Linker can hold one without
//! caring which backend produced it.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{ForestError, Result};
use crate::tokenizer::tokenize;

const HASHED_DIM: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`, returning `Ok(None)` when no vector is available
    /// (provider disabled, or the `none` backend). Any returned vector is
    /// L2-normalized.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;

    /// Stable, human-readable name used in logs and node metadata.
    fn name(&self) -> &str;
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Spawns a configured subprocess, writes `text` to stdin, reads a single
/// newline-delimited JSON float array from stdout.
pub struct LocalSubprocessEmbedder {
    program: String,
    args: Vec<String>,
}

impl LocalSubprocessEmbedder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

#[async_trait]
impl Embedder for LocalSubprocessEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ForestError::ProviderError(format!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| ForestError::ProviderError(format!("write stdin: {e}")))?;
        }

        let mut out = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut out)
                .await
                .map_err(|e| ForestError::ProviderError(format!("read stdout: {e}")))?;
        }
        let _ = child.wait().await;

        let vec: Vec<f32> = serde_json::from_str(out.trim())
            .map_err(|e| ForestError::ProviderError(format!("parse embedding: {e}")))?;
        Ok(Some(l2_normalize(vec)))
    }

    fn name(&self) -> &str {
        "local-subprocess"
    }
}

/// Trait-only remote provider: the core defines the contract, an external
/// collaborator (e.g. the CLI, wired to an HTTP client of its choosing)
/// supplies the transport. `RemoteHttpEmbedder` here is a thin shell that
/// always reports the provider as unavailable, documenting the seam without
/// pulling an HTTP client dependency into the core.
pub struct RemoteHttpEmbedder {
    provider: String,
}

impl RemoteHttpEmbedder {
    pub fn new(provider: impl Into<String>) -> Self {
        Self { provider: provider.into() }
    }
}

#[async_trait]
impl Embedder for RemoteHttpEmbedder {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
        Err(ForestError::EmbeddingUnavailable(format!(
            "remote provider '{}' requires a transport supplied outside forest-core",
            self.provider
        )))
    }

    fn name(&self) -> &str {
        "remote-http"
    }
}

/// Deterministic bag-of-tokens hash into a fixed 384-dimension vector,
/// L2-normalized. Used for offline mode and as the default test double.
pub struct HashedFallbackEmbedder;

#[async_trait]
impl Embedder for HashedFallbackEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let counts = tokenize(text);
        if counts.is_empty() {
            return Ok(Some(l2_normalize(vec![0.0; HASHED_DIM])));
        }
        let mut v = vec![0.0f32; HASHED_DIM];
        for (token, count) in &counts {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = (u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize) % HASHED_DIM;
            let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign * (*count as f32);
        }
        Ok(Some(l2_normalize(v)))
    }

    fn name(&self) -> &str {
        "hashed-fallback"
    }
}

/// Always returns no vector; used when embedding is disabled entirely.
pub struct NoneEmbedder;

#[async_trait]
impl Embedder for NoneEmbedder {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Decorates another embedder with a concurrent by-text cache, avoiding a
/// repeat subprocess/HTTP round-trip for text already embedded this
/// process (chunks re-imported after an edit, repeated search queries).
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: DashMap<String, Vec<f32>>,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self { inner, cache: DashMap::new() }
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        if let Some(cached) = self.cache.get(text) {
            return Ok(Some(cached.clone()));
        }
        let result = self.inner.embed(text).await?;
        if let Some(vec) = &result {
            self.cache.insert(text.to_string(), vec.clone());
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Build the configured embedder, falling back to the hashed embedder for
/// an unrecognized provider name rather than failing startup. Remote and
/// subprocess providers are wrapped in a [`CachingEmbedder`]; the
/// deterministic local ones are cheap enough not to need it.
pub fn create_embedder(provider: &str) -> Arc<dyn Embedder> {
    match provider {
        "none" => Arc::new(NoneEmbedder),
        "mock" => Arc::new(HashedFallbackEmbedder),
        "local" => Arc::new(CachingEmbedder::new(Arc::new(LocalSubprocessEmbedder::new("forest-embed", vec![])))),
        "openrouter" | "openai" => Arc::new(CachingEmbedder::new(Arc::new(RemoteHttpEmbedder::new(provider.to_string())))),
        _ => Arc::new(HashedFallbackEmbedder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embedder_is_deterministic_and_normalized() {
        let e = HashedFallbackEmbedder;
        let a = e.embed("hello world").await.unwrap().unwrap();
        let b = e.embed("hello world").await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASHED_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[tokio::test]
    async fn none_embedder_returns_none() {
        let e = NoneEmbedder;
        assert!(e.embed("anything").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_embedder_reports_unavailable() {
        let e = RemoteHttpEmbedder::new("openrouter");
        assert!(e.embed("x").await.is_err());
    }

    #[tokio::test]
    async fn caching_embedder_serves_repeat_calls_from_cache() {
        let inner = Arc::new(HashedFallbackEmbedder);
        let cached = CachingEmbedder::new(inner);
        let first = cached.embed("cache me").await.unwrap();
        let second = cached.embed("cache me").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.cache.len(), 1);
    }

    #[test]
    fn create_embedder_falls_back_to_hashed_for_unknown_provider() {
        let e = create_embedder("something-unknown");
        assert_eq!(e.name(), "hashed-fallback");
    }
}
