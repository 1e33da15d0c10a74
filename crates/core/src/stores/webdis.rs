use crate::cache::QueryCache;
use crate::error::RagError;
use crate::models::QueryOutcome;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const KEY_PREFIX: &str = "rag:query:";
const DOCUMENT_SET_PREFIX: &str = "rag:document:";
const DEFAULT_TRACKING_TTL: Duration = Duration::from_secs(7_200);

/// Query cache in Redis, reached through a Webdis HTTP gateway
/// (`GET /GET/<key>`, `PUT /SETEX/<key>/<ttl>` with the value as body, ...).
///
/// Each document's entry keys are tracked in a Redis set for invalidation. The set expires
/// no sooner than the longest entry TTL, so it does not outlive its entries for long.
pub struct WebdisCache {
    endpoint: Url,
    client: Client,
    tracking_ttl: Duration,
}

impl WebdisCache {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RagError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|error| RagError::InvalidArgument(format!("cache url {endpoint:?}: {error}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(RagError::InvalidArgument(format!(
                "cache url {endpoint} cannot carry command paths"
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RagError::Cache(error.to_string()))?;

        Ok(Self {
            endpoint,
            client,
            tracking_ttl: DEFAULT_TRACKING_TTL,
        })
    }

    /// Lower bound for the expiry of the per-document key sets; use the success TTL.
    pub fn with_tracking_ttl(mut self, ttl: Duration) -> Self {
        self.tracking_ttl = ttl;
        self
    }

    fn tracking_ttl_secs(&self, entry_ttl: Duration) -> String {
        entry_ttl.max(self.tracking_ttl).as_secs().max(1).to_string()
    }

    fn command_url(&self, segments: &[&str]) -> Result<Url, RagError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RagError::Cache(format!("cache url {} cannot carry command paths", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn command(&self, segments: &[&str], body: Option<String>) -> Result<Value, RagError> {
        let url = self.command_url(segments)?;
        let request = match body {
            Some(body) => self.client.put(url).body(body),
            None => self.client.get(url),
        };

        let response = request
            .send()
            .await
            .map_err(|error| RagError::Cache(error.to_string()))?;
        if !response.status().is_success() {
            return Err(RagError::Cache(format!(
                "webdis {} returned {}",
                segments.first().copied().unwrap_or_default(),
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|error| RagError::Cache(error.to_string()))
    }

    fn entry_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    fn document_set(document_id: &str) -> String {
        format!("{DOCUMENT_SET_PREFIX}{document_id}:keys")
    }
}

#[async_trait]
impl QueryCache for WebdisCache {
    async fn get(&self, key: &str) -> Result<Option<QueryOutcome>, RagError> {
        let entry_key = Self::entry_key(key);
        let reply = self.command(&["GET", &entry_key], None).await?;

        match reply.get("GET") {
            Some(Value::String(raw)) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|error| RagError::Cache(format!("corrupt entry {key}: {error}"))),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(RagError::Cache(format!("unexpected GET reply: {other}"))),
        }
    }

    async fn put(
        &self,
        document_id: &str,
        key: &str,
        outcome: &QueryOutcome,
        ttl: Duration,
    ) -> Result<(), RagError> {
        let entry_key = Self::entry_key(key);
        let ttl_secs = ttl.as_secs().max(1).to_string();
        let body = serde_json::to_string(outcome)
            .map_err(|error| RagError::Cache(error.to_string()))?;

        self.command(&["SETEX", &entry_key, &ttl_secs], Some(body)).await?;
        let set = Self::document_set(document_id);
        self.command(&["SADD", &set, &entry_key], None).await?;
        self.command(&["EXPIRE", &set, &self.tracking_ttl_secs(ttl)], None)
            .await?;
        Ok(())
    }

    async fn invalidate_document(&self, document_id: &str) -> Result<usize, RagError> {
        let set = Self::document_set(document_id);
        let reply = self.command(&["SMEMBERS", &set], None).await?;
        let members = parse_members(&reply)?;

        let mut segments = vec!["DEL"];
        segments.extend(members.iter().map(String::as_str));
        segments.push(&set);
        let reply = self.command(&segments, None).await?;

        let deleted = reply.get("DEL").and_then(Value::as_u64).unwrap_or(0) as usize;
        // The tracking set itself is not a query entry.
        let set_removed = usize::from(!members.is_empty() || deleted > 0);
        Ok(deleted.saturating_sub(set_removed))
    }
}

fn parse_members(reply: &Value) -> Result<Vec<String>, RagError> {
    match reply.get("SMEMBERS") {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(RagError::Cache(format!("unexpected SMEMBERS reply: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_urls_escape_segments() -> Result<(), RagError> {
        let cache = WebdisCache::new("http://localhost:7379/", Duration::from_secs(1))?;
        let url = cache.command_url(&["SADD", "rag:document:a b:keys", "k/1"])?;
        assert_eq!(
            url.as_str(),
            "http://localhost:7379/SADD/rag:document:a%20b:keys/k%2F1"
        );
        Ok(())
    }

    #[test]
    fn tracking_sets_outlive_every_entry() -> Result<(), RagError> {
        let cache = WebdisCache::new("http://localhost:7379/", Duration::from_secs(1))?
            .with_tracking_ttl(Duration::from_secs(7_200));

        assert_eq!(cache.tracking_ttl_secs(Duration::from_secs(300)), "7200");
        assert_eq!(cache.tracking_ttl_secs(Duration::from_secs(86_400)), "86400");

        let short = WebdisCache::new("http://localhost:7379/", Duration::from_secs(1))?
            .with_tracking_ttl(Duration::ZERO);
        assert_eq!(short.tracking_ttl_secs(Duration::ZERO), "1");
        Ok(())
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(WebdisCache::new("not a url", Duration::from_secs(1)).is_err());
        assert!(WebdisCache::new("mailto:cache@example.com", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn smembers_replies_are_parsed() -> Result<(), RagError> {
        let members = parse_members(&json!({"SMEMBERS": ["rag:query:a", "rag:query:b"]}))?;
        assert_eq!(members, vec!["rag:query:a".to_string(), "rag:query:b".to_string()]);
        assert!(parse_members(&json!({"SMEMBERS": []}))?.is_empty());
        assert!(parse_members(&json!({"SMEMBERS": 3})).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_store_is_a_cache_error() -> Result<(), RagError> {
        let cache = WebdisCache::new("http://127.0.0.1:9/", Duration::from_millis(200))?;
        assert!(matches!(cache.get("k").await, Err(RagError::Cache(_))));
        Ok(())
    }
}
