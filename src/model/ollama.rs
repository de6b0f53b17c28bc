use std::io::{BufRead, BufReader};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{DEFAULT_CONTEXT_WINDOW, ModelGateway, SamplingParams};
use crate::config::Config;
use crate::error::{InferError, Result};

/// Ollama exposes no tokenizer endpoint, so prompt sizes are estimated.
const CHARS_PER_TOKEN: usize = 4;

/// Model gateway backed by a local or remote Ollama server.
///
/// Prompts are fully rendered on our side and sent with `raw = true`, so
/// Ollama's own template is bypassed.  Streaming responses arrive as NDJSON
/// lines; the stop predicate is checked between lines and dropping the
/// response closes the connection, which aborts decoding on the server.
pub struct OllamaGateway {
    client: Client,
    base_url: String,
    model: String,
    context_window: usize,
}

#[derive(Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    raw: bool,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: usize,
    num_ctx: usize,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

/// One decoded line of the `/api/generate` stream.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Fragment(String),
    Done {
        reason: Option<String>,
        eval_count: Option<u64>,
        prompt_eval_count: Option<u64>,
    },
}

impl OllamaGateway {
    /// Connect to the server and make sure the model is available, pulling
    /// it first when the provider allows remote fetches.
    pub fn load(config: &Config) -> Result<Self> {
        let base_url = config.model.host.trim_end_matches('/').to_string();
        let model = config.model.name.clone();

        let timeout = (config.model.timeout_secs > 0)
            .then(|| Duration::from_secs(config.model.timeout_secs));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(
            model = %model,
            base_url = %base_url,
            provider = %config.model.provider,
            "loading Ollama model"
        );

        let mut gateway = Self {
            client,
            base_url,
            model,
            context_window: DEFAULT_CONTEXT_WINDOW,
        };

        let show = match gateway.show()? {
            Some(show) => show,
            None if config.allows_remote_fetch() => {
                gateway.pull()?;
                gateway.show()?.ok_or_else(|| {
                    InferError::ModelUnavailable(format!(
                        "model {} still missing after pull",
                        gateway.model
                    ))
                })?
            }
            None => {
                return Err(InferError::ModelUnavailable(format!(
                    "model {} is not available locally and provider is \"local\"",
                    gateway.model
                )));
            }
        };

        gateway.context_window = if config.model.context_length > 0 {
            config.model.context_length
        } else {
            context_length_from_show(&show).unwrap_or(DEFAULT_CONTEXT_WINDOW)
        };

        Ok(gateway)
    }

    /// `POST /api/show`.  `Ok(None)` means the server does not know the model.
    fn show(&self) -> Result<Option<Value>> {
        let url = format!("{}/api/show", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&ModelRequest {
                model: &self.model,
                stream: None,
            })
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(classify_error(status, &body));
        }

        Ok(Some(resp.json::<Value>()?))
    }

    /// `POST /api/pull` (non-streaming; returns once the weights are local).
    fn pull(&self) -> Result<()> {
        info!(model = %self.model, "model not present, pulling");
        let url = format!("{}/api/pull", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&ModelRequest {
                model: &self.model,
                stream: Some(false),
            })
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(classify_error(status, &body));
        }
        info!(model = %self.model, "model pulled");
        Ok(())
    }
}

impl ModelGateway for OllamaGateway {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(estimate_tokens(text))
    }

    fn generate(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        sampling: &SamplingParams,
        should_stop: &dyn Fn() -> bool,
        on_fragment: &mut dyn FnMut(String) -> bool,
    ) -> Result<()> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            raw: true,
            stream: true,
            options: GenerateOptions {
                num_predict: max_new_tokens,
                num_ctx: self.context_window,
                temperature: if sampling.do_sample { sampling.temperature } else { 0.0 },
                top_p: sampling.top_p,
                top_k: sampling.top_k,
            },
        };

        debug!(
            model = %self.model,
            prompt_len = prompt.len(),
            max_new_tokens,
            "invoking Ollama generate"
        );

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().unwrap_or_default();
            warn!(status = %status, error = %error_text, "Ollama API error");
            return Err(classify_error(status, &error_text));
        }

        for line in BufReader::new(resp).lines() {
            if should_stop() {
                return Err(InferError::CancelledByCaller);
            }

            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match parse_stream_line(&line)? {
                StreamLine::Fragment(text) => {
                    if !text.is_empty() && !on_fragment(text) {
                        return Ok(());
                    }
                }
                StreamLine::Done {
                    reason,
                    eval_count,
                    prompt_eval_count,
                } => {
                    debug!(
                        reason = reason.as_deref().unwrap_or("unknown"),
                        eval_tokens = eval_count.unwrap_or(0),
                        prompt_tokens = prompt_eval_count.unwrap_or(0),
                        "Ollama generation finished"
                    );
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let chunk: GenerateChunk = serde_json::from_str(line)?;

    if let Some(error) = chunk.error {
        return Err(classify_error(StatusCode::INTERNAL_SERVER_ERROR, &error));
    }

    if chunk.done {
        // The final line may still carry a trailing fragment.
        if !chunk.response.is_empty() {
            return Ok(StreamLine::Fragment(chunk.response));
        }
        return Ok(StreamLine::Done {
            reason: chunk.done_reason,
            eval_count: chunk.eval_count,
            prompt_eval_count: chunk.prompt_eval_count,
        });
    }

    Ok(StreamLine::Fragment(chunk.response))
}

/// Pull `<arch>.context_length` out of an `/api/show` response.
fn context_length_from_show(show: &Value) -> Option<usize> {
    show.get("model_info")?
        .as_object()?
        .iter()
        .find(|(key, _)| key.ends_with(".context_length"))
        .and_then(|(_, v)| v.as_u64())
        .map(|n| n as usize)
}

/// Extract the message from an `{"error": "..."}` body, falling back to the
/// raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn classify_error(status: StatusCode, body: &str) -> InferError {
    let message = error_message(body);
    let lower = message.to_lowercase();

    if lower.contains("out of memory")
        || lower.contains("requires more system memory")
        || lower.contains("insufficient memory")
    {
        return InferError::ResourceExhausted(format!("model does not fit: {message}"));
    }

    match status {
        StatusCode::NOT_FOUND => InferError::ModelUnavailable(format!("model not found: {message}")),
        StatusCode::SERVICE_UNAVAILABLE => InferError::ModelUnavailable(message),
        _ => InferError::Generation(format!("Ollama returned {status}: {message}")),
    }
}

fn transport_error(e: reqwest::Error) -> InferError {
    if e.is_connect() || e.is_timeout() {
        InferError::ModelUnavailable(format!("cannot reach model server: {e}"))
    } else {
        InferError::Http(e)
    }
}
