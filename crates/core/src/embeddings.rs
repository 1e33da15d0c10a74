use crate::error::RagError;
use crate::retry::{ClientRotation, RetryPolicy};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Text-in, vector-out embedding service. Output is deterministic for a given
/// `(text, model_version)`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_version(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Local hashing embedder over character trigrams. Needs no model server.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_version(&self) -> &str {
        "char-trigram-v1"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

pub fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingEndpoint {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

/// Embedding server speaking the Ollama `/api/embed` batch protocol. Requests rotate over
/// the configured endpoints; an endpoint answering 429 cools down before reuse.
pub struct HttpEmbedder {
    client: Client,
    endpoints: ClientRotation<EmbeddingEndpoint>,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoints: Vec<EmbeddingEndpoint>,
        model: impl Into<String>,
        dimensions: usize,
        cooldown: Duration,
    ) -> Result<Self, RagError> {
        if endpoints.is_empty() {
            return Err(RagError::InvalidArgument(
                "at least one embedding endpoint is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|error| RagError::Embedding(error.to_string()))?;

        Ok(Self {
            client,
            endpoints: ClientRotation::new(endpoints, cooldown),
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (index, endpoint) = self
            .endpoints
            .next()
            .ok_or_else(|| RagError::Embedding("no embedding endpoint configured".to_string()))?;

        let mut request = self
            .client
            .post(format!("{}/api/embed", endpoint.url.trim_end_matches('/')))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(api_key) = &endpoint.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RagError::Embedding(error.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            self.endpoints.mark_exhausted(index);
            return Err(RagError::Embedding(format!(
                "embedding endpoint {} is rate limited",
                endpoint.url
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "embedding endpoint {} returned {status}: {body}",
                endpoint.url
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|error| RagError::Embedding(error.to_string()))?;
        let embeddings = parsed
            .embeddings
            .ok_or_else(|| RagError::Embedding("response carried no embeddings".to_string()))?;

        check_batch(&embeddings, texts.len(), self.dimensions)?;
        Ok(embeddings)
    }
}

fn check_batch(embeddings: &[Vec<f32>], expected: usize, dimensions: usize) -> Result<(), RagError> {
    if embeddings.len() != expected {
        return Err(RagError::Embedding(format!(
            "embedding count {} doesn't match input count {expected}",
            embeddings.len()
        )));
    }
    if let Some(bad) = embeddings.iter().find(|vector| vector.len() != dimensions) {
        return Err(RagError::Embedding(format!(
            "embedding dimension {} != {dimensions}",
            bad.len()
        )));
    }
    Ok(())
}

/// Embeds `texts` in batches of `batch_size`, retrying each batch under `policy`.
/// Output order matches input order. Any batch that still fails aborts the whole call.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, RagError> {
    let mut vectors = Vec::with_capacity(texts.len());
    let batches = texts.chunks(batch_size.max(1));
    let batch_count = batches.len();

    for (number, batch) in batches.enumerate() {
        let embedded = policy
            .run("embed_batch", move |_| embedder.embed_batch(batch))
            .await?;
        check_batch(&embedded, batch.len(), embedder.dimensions())?;
        vectors.extend(embedded);
        debug!(batch = number + 1, batch_count, embedded = vectors.len(), "embedded batch");
    }

    Ok(vectors)
}

pub async fn embed_query(
    embedder: &dyn Embedder,
    question: &str,
    policy: &RetryPolicy,
) -> Result<Vec<f32>, RagError> {
    let input = [question.to_string()];
    let input = &input[..];
    let mut vectors = policy
        .run("embed_query", move |_| embedder.embed_batch(input))
        .await?;
    vectors
        .pop()
        .ok_or_else(|| RagError::Embedding("empty embedding for query".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Database normalization and keys");
        let second = embedder.embed("Database normalization and keys");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn embeddings_are_unit_length() {
        let vector = CharacterNgramEmbedder::default().embed("normalization of relations");
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    struct FlakyEmbedder {
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_version(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(RagError::Embedding("transient".to_string()));
            }
            Ok(texts.iter().map(|text| vec![text.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn embed_all_batches_and_retries() {
        let embedder = FlakyEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: 1,
        };
        let texts = (0..5).map(|index| "x".repeat(index + 1)).collect::<Vec<_>>();
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let vectors = embed_all(&embedder, &texts, 2, &policy).await.expect("retry recovers");

        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[4][0], 5.0);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn embed_all_fails_when_retries_run_out() {
        let embedder = FlakyEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: 0,
        };
        let texts = vec!["a".to_string()];
        let policy = RetryPolicy::new(1, Duration::from_millis(1));

        let result = embed_all(&embedder, &texts, 8, &policy).await;
        assert!(matches!(result, Err(RagError::Embedding(_))));
    }

    #[test]
    fn http_embedder_needs_an_endpoint() {
        let result = HttpEmbedder::new(Vec::new(), "nomic-embed-text", 768, Duration::from_secs(30));
        assert!(result.is_err());
    }
}
