use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::api_key::ApiKey;
use crate::config::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::error::{Error, Result};
use crate::history::{ChatHistory, ChatTurn};

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatTurn>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct Response {
    // Not every compatible server sends these
    id: Option<String>,
    model: Option<String>,

    choices: Vec<Choice>,

    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    // null when the model answered with a tool call or was filtered
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponseContainer {
    error: ErrorResponse,
}

/// Turns a non-2xx response into [`Error::Request`], preferring the server's
/// `error.message` over the raw body.
pub(crate) async fn read_error_body(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());
    let body = match serde_json::from_str::<ErrorResponseContainer>(&body) {
        Ok(container) => container.error.message,
        Err(_) => body,
    };
    Error::Request { status, body }
}

/// Per-call sampling parameters. Model, `max_tokens` and temperature are
/// client-wide settings on [`CompletionClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Number of answers to generate.
    pub n: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop: Option<Vec<String>>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        CompletionOptions {
            n: 1,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
        }
    }
}

impl CompletionOptions {
    pub fn with_n(n: u32) -> Self {
        CompletionOptions {
            n,
            ..Self::default()
        }
    }
}

/// `CompletionClient` talks to an OpenAI compatible chat-completion endpoint
/// and keeps the conversation so far.
///
/// Every request carries the whole history followed by the new prompt. After
/// a successful reply the prompt and the *first* answer are appended to the
/// history, no matter how many answers were requested.
pub struct CompletionClient {
    client: Client,
    api_base: String,
    api_key: ApiKey,
    model: String,
    max_tokens: u32,
    temperature: f32,
    history: ChatHistory,
}

impl CompletionClient {
    pub fn new(api_base: impl Into<String>, api_key: ApiKey) -> Self {
        CompletionClient {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            history: ChatHistory::new(),
        }
    }

    /// Sends `prompt` and returns the generated answers in server order.
    ///
    /// Transport errors, error statuses and malformed replies are logged and
    /// produce an empty list, which callers should read as "no answer" (as
    /// opposed to an answer that happens to be empty text).
    pub async fn complete(&mut self, prompt: &str, options: &CompletionOptions) -> Vec<String> {
        match self.try_complete(prompt, options).await {
            Ok(answers) => answers,
            Err(e) => {
                error!("completion request failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Like [`complete`](Self::complete) but hands the error to the caller.
    /// The history is left untouched on error. A blank prompt sends nothing
    /// and produces no answers.
    pub async fn try_complete(
        &mut self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Vec<String>> {
        if prompt.trim().is_empty() {
            debug!("blank prompt, skipping completion request");
            return Ok(Vec::new());
        }

        let user_turn = ChatTurn::user(prompt);
        let request = {
            let body = self.build_request_body(&user_turn, options);
            debug!("completion request: {:?}", body);
            self.client
                .post(format!("{}/chat/completions", self.api_base))
                .bearer_auth(self.api_key.expose())
                .json(&body)
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(read_error_body(response).await);
        }

        let response_text = response.text().await?;
        let answers = Self::process_response(&response_text)?;

        if let Some(first) = answers.first() {
            self.history.push_exchange(prompt, first.clone());
        }
        Ok(answers)
    }

    fn build_request_body<'a>(
        &'a self,
        user_turn: &'a ChatTurn,
        options: &'a CompletionOptions,
    ) -> CompletionRequest<'a> {
        let messages = self
            .history
            .turns()
            .iter()
            .chain(std::iter::once(user_turn))
            .collect();

        CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            n: options.n,
            stop: options.stop.as_deref(),
        }
    }

    fn process_response(response_text: &str) -> Result<Vec<String>> {
        let response: Response = serde_json::from_str(response_text)?;
        debug!(
            "completion {} from model {}",
            response.id.as_deref().unwrap_or("-"),
            response.model.as_deref().unwrap_or("-")
        );
        if let Some(usage) = &response.usage {
            debug!(
                "token usage: prompt {}, completion {}, total {}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        Ok(response
            .choices
            .into_iter()
            .map(|choice| choice.message.content.unwrap_or_default())
            .collect())
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = max_tokens;
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
