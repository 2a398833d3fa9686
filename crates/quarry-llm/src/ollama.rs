use ollama_rs::Ollama;
use ollama_rs::error::OllamaError;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::models::ModelOptions;

use crate::error::LlmError;
use crate::provider::{GenerateOptions, LlmProvider, Message, Role};

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    model: String,
    embedding_model: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, model: String, embedding_model: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
            embedding_model,
        }
    }

    /// Check if Ollama is reachable.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Unavailable` if the connection to Ollama fails.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        self.client
            .list_local_models()
            .await
            .map_err(|e| LlmError::Unavailable(format!("cannot reach Ollama: {e}")))?;
        Ok(())
    }
}

impl LlmProvider for OllamaProvider {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        let ollama_messages: Vec<ChatMessage> = messages.iter().map(convert_message).collect();
        let request = ChatMessageRequest::new(self.model.clone(), ollama_messages)
            .options(model_options(options));

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| classify_error("chat", e))?;

        if response.message.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse { provider: "ollama" });
        }
        Ok(response.message.content)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| classify_error("embedding", e))?;

        if response.embeddings.len() != texts.len() {
            return Err(LlmError::MalformedResponse(format!(
                "Ollama returned {} embeddings for {} inputs",
                response.embeddings.len(),
                texts.len()
            )));
        }
        Ok(response.embeddings)
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg.role {
        Role::System => ChatMessage::system(msg.content.clone()),
        Role::User => ChatMessage::user(msg.content.clone()),
        Role::Assistant => ChatMessage::assistant(msg.content.clone()),
    }
}

fn model_options(options: &GenerateOptions) -> ModelOptions {
    ModelOptions::default()
        .num_predict(i32::try_from(options.max_tokens).unwrap_or(i32::MAX))
        .temperature(options.temperature)
}

/// Split ollama-rs failures into retryable and final ones.
///
/// The client drops the HTTP status of error responses and keeps only the body, so
/// server-side overload is recognised by its message. Everything else the server
/// answers (unknown model, bad request) is a rejection.
fn classify_error(call: &str, err: OllamaError) -> LlmError {
    match err {
        OllamaError::ReqwestError(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
            LlmError::Unavailable(format!("Ollama {call} request failed: {e}"))
        }
        OllamaError::Other(body) => {
            let message = error_message(&body);
            let lower = message.to_ascii_lowercase();
            if ["busy", "try again", "overloaded", "unavailable"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                LlmError::Unavailable(format!("Ollama {call} request failed: {message}"))
            } else {
                LlmError::InvalidRequest(format!("Ollama {call} request rejected: {message}"))
            }
        }
        OllamaError::InternalError(e) => {
            LlmError::InvalidRequest(format!("Ollama {call} request rejected: {}", e.message))
        }
        OllamaError::JsonError(e) => LlmError::MalformedResponse(format!("Ollama {call}: {e}")),
        other => LlmError::Other(format!("Ollama {call} request failed: {other}")),
    }
}

/// Ollama error bodies look like `{"error": "..."}`; fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned())
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':')
        && let Ok(port) = url[colon_pos + 1..].parse::<u16>()
    {
        return (url[..colon_pos].to_string(), port);
    }
    (url.to_string(), 11434)
}
