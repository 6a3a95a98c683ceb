//! Embedding providers.
//!
//! [`Embedder`] is the seam the pipelines talk to. [`OpenAiEmbedder`] calls an
//! OpenAI-compatible `/embeddings` endpoint; [`HashEmbedder`] is an offline
//! feature-hashing model with stable output, used when no provider is
//! configured and in tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::config::{EmbeddingProvider, Settings};

pub type Embedding = Vec<f32>;

/// Inputs per request to the embeddings endpoint.
const EMBED_BATCH_SIZE: usize = 100;

/// Dimension of [`HashEmbedder`] vectors.
pub const HASH_EMBEDDING_DIM: usize = 256;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("input contains disallowed special token {0}")]
    DisallowedToken(String),
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError>;

    /// Embeds `texts` in order. Stops at the first failure.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Builds the embedder selected in the settings.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn Embedder>> {
    match settings.embedding_provider {
        EmbeddingProvider::OpenAi => {
            if settings.openai_api_key.is_empty() {
                bail!("OPENAI_API_KEY is not set; configure it or use EMBEDDING_PROVIDER \"hash\"");
            }
            Ok(Arc::new(OpenAiEmbedder::new(settings)?))
        }
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder)),
    }
}

lazy_static! {
    static ref SPECIAL_TOKEN: Regex =
        Regex::new(r"<\|(endoftext|fim_prefix|fim_middle|fim_suffix|endofprompt)\|>").unwrap();
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Rejects text that carries a tokenizer control sequence.
pub fn check_disallowed(text: &str) -> Result<(), EmbedError> {
    match SPECIAL_TOKEN.find(text) {
        Some(m) => Err(EmbedError::DisallowedToken(m.as_str().to_string())),
        None => Ok(()),
    }
}

pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAiEmbedder {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            api_key: settings.openai_api_key.clone(),
            model: settings.embedding_model.clone(),
        })
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Embedding>, EmbedError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbedError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.len() != input.len() {
            return Err(EmbedError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                input.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|item| item.index);
        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        check_disallowed(text)?;
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::MalformedResponse("missing embedding data".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedError> {
        for text in texts {
            check_disallowed(text)?;
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            debug!(model = %self.model, inputs = batch.len(), "requesting embeddings");
            out.extend(self.request(batch).await?);
        }
        Ok(out)
    }
}

/// Feature-hashing embedder: each token lands in a fixed bucket and the
/// term-frequency vector is L2-normalized. Same text, same vector.
pub struct HashEmbedder;

impl HashEmbedder {
    fn tokenize(text: &str) -> Vec<String> {
        let text = text.nfc().collect::<String>().to_lowercase();
        NON_WORD
            .replace_all(&text, " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    fn bucket(token: &str) -> usize {
        let mut hasher = FxHasher::default();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % HASH_EMBEDDING_DIM
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash-256"
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        let mut tf = vec![0.0f32; HASH_EMBEDDING_DIM];
        for token in Self::tokenize(text) {
            tf[Self::bucket(&token)] += 1.0;
        }

        let norm = tf.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut tf {
                *x /= norm;
            }
        }
        Ok(tf)
    }
}
