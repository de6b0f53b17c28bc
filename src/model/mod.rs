pub mod ollama;
#[cfg(test)]
pub mod scripted;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{InferError, Result};
use crate::session::prompt::ChatMessage;

/// Context window assumed when neither the config nor the backend report one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 2048;

/// Fixed sampling parameters for every generation.  Callers of the HTTP API
/// cannot change them.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
        }
    }
}

// -- Gateway trait -----------------------------------------------------------

/// The single shared model instance.
///
/// Loaded once at startup and shared read-only by every generation task.
/// All methods are synchronous and may block for a long time, so callers
/// run them on the blocking thread pool.  Implementations must be safe to
/// call from several generation tasks at once.
pub trait ModelGateway: Send + Sync {
    /// Human-readable backend name (e.g. "ollama").
    fn name(&self) -> &str;

    /// Name of the loaded model.
    fn model(&self) -> &str;

    /// Maximum number of tokens (prompt + generated) the model accepts.
    fn context_window(&self) -> usize;

    /// Number of tokens `text` encodes to.
    fn count_tokens(&self, text: &str) -> Result<usize>;

    /// Serialize messages with the model's own chat template.  `None` means
    /// no template is available and the plain-text renderer is used.
    fn apply_chat_template(&self, _messages: &[ChatMessage]) -> Option<String> {
        None
    }

    /// Generate at most `max_new_tokens` tokens for `prompt`.
    ///
    /// `should_stop` is polled once per decoding step; when it returns true
    /// the call returns [`InferError::CancelledByCaller`].  Every decoded
    /// fragment is passed to `on_fragment`; a `false` return means nobody is
    /// listening any more and generation ends early with `Ok(())`.
    fn generate(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        sampling: &SamplingParams,
        should_stop: &dyn Fn() -> bool,
        on_fragment: &mut dyn FnMut(String) -> bool,
    ) -> Result<()>;
}

/// Token budget left for generation, floored at one token.
///
/// A prompt that already fills the context window still gets a single
/// generated token instead of an error.
pub fn generation_budget(context_window: usize, prompt_tokens: usize) -> usize {
    context_window.saturating_sub(prompt_tokens).max(1)
}

/// Load the configured gateway.  Blocks until the model is ready, so call
/// it from the blocking pool (or before the runtime starts serving).
pub fn load(config: &Config) -> Result<Arc<dyn ModelGateway>> {
    let gateway: Arc<dyn ModelGateway> = match config.model.backend.as_str() {
        "ollama" => Arc::new(ollama::OllamaGateway::load(config)?),
        other => {
            return Err(InferError::Config(format!(
                "unknown model backend \"{other}\" (available: [ollama])"
            )));
        }
    };

    info!(
        backend = gateway.name(),
        model = gateway.model(),
        context_window = gateway.context_window(),
        "model gateway ready"
    );

    Ok(gateway)
}
