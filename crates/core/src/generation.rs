use crate::error::RagError;
use crate::retry::ClientRotation;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Produces an answer to `question` grounded in the ordered `context` passages.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, question: &str, context: &[String]) -> Result<String, RagError>;
}

pub fn build_grounding_prompt(question: &str, context: &[String]) -> String {
    let passages = if context.is_empty() {
        "(no passages were retrieved)".to_string()
    } else {
        context
            .iter()
            .enumerate()
            .map(|(index, passage)| format!("[{}] {}", index + 1, passage.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "You are a study assistant answering questions about one document.\n\
         \n\
         Guidelines:\n\
         1. Answer primarily from the document excerpts below.\n\
         2. Explain concepts fully; do not just repeat the excerpts.\n\
         3. Where the excerpts are incomplete, elaborate with general knowledge.\n\
         4. Whenever you go beyond the excerpts, say so explicitly \
         (for example: \"The document mentions X. Additionally, ...\").\n\
         \n\
         Document excerpts:\n\
         {passages}\n\
         \n\
         Question: {question}\n\
         \n\
         Answer:"
    )
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub model: String,
    pub api_keys: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub key_cooldown: Duration,
}

/// Chat-completions client (`POST <base_url>/chat/completions`). Each call takes the next
/// API key from the rotation; a key answered with 429 cools down and the call moves on to
/// the next key.
pub struct HttpGenerator {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    keys: ClientRotation<Option<String>>,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| RagError::Generation(error.to_string()))?;

        let keys = if config.api_keys.is_empty() {
            vec![None]
        } else {
            config.api_keys.into_iter().map(Some).collect()
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            keys: ClientRotation::new(keys, config.key_cooldown),
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String, RagError> {
        let mut last_error = RagError::Generation("no API key available".to_string());

        for _ in 0..self.keys.len() {
            let Some((index, key)) = self.keys.next() else {
                break;
            };

            let mut request = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .json(&ChatRequest {
                    model: &self.model,
                    messages: vec![ChatMessage {
                        role: "user",
                        content: prompt,
                    }],
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                });
            if let Some(key) = key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|error| RagError::Generation(error.to_string()))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                self.keys.mark_exhausted(index);
                last_error = RagError::Generation(format!("API key #{index} is rate limited"));
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(RagError::Generation(format!(
                    "generation service returned {status}: {body}"
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|error| RagError::Generation(error.to_string()))?;
            return extract_answer(parsed);
        }

        Err(last_error)
    }
}

fn extract_answer(response: ChatResponse) -> Result<String, RagError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| RagError::Generation("empty response from generation service".to_string()))
}

#[async_trait]
impl AnswerGenerator for HttpGenerator {
    async fn generate(&self, question: &str, context: &[String]) -> Result<String, RagError> {
        let prompt = build_grounding_prompt(question, context);
        self.complete(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_numbers_passages_in_order() {
        let prompt = build_grounding_prompt(
            "What is 3NF?",
            &["First passage.".to_string(), " Second passage. ".to_string()],
        );

        let first = prompt.find("[1] First passage.").expect("first passage present");
        let second = prompt.find("[2] Second passage.").expect("second passage present");
        assert!(first < second);
        assert!(prompt.contains("Question: What is 3NF?"));
        assert!(prompt.contains("general knowledge"));
        assert!(prompt.contains("say so explicitly"));
    }

    #[test]
    fn prompt_without_context_says_so() {
        let prompt = build_grounding_prompt("Why?", &[]);
        assert!(prompt.contains("no passages were retrieved"));
    }

    #[test]
    fn answers_are_trimmed_and_required() -> Result<(), serde_json::Error> {
        let ok: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  Third normal form. "}}]}"#)?;
        assert_eq!(extract_answer(ok).ok().as_deref(), Some("Third normal form."));

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#)?;
        assert!(matches!(extract_answer(empty), Err(RagError::Generation(_))));

        let blank: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"   "}}]}"#)?;
        assert!(extract_answer(blank).is_err());
        Ok(())
    }
}
