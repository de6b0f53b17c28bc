use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ConversationId;
use super::prompt::{self, ChatMessage};
use super::registry::{GenerationHandle, SessionRegistry};
use crate::config::Config;
use crate::error::{InferError, Result};
use crate::model::{self, ModelGateway, SamplingParams};

/// Literal sentinel that ends every response stream.
pub const END_TOKEN: &str = "[DONE]";

/// One conversation turn submitted for generation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, rename = "conversationId", alias = "conversation_id")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(
        default,
        rename = "chatHistory",
        alias = "chat_history",
        alias = "history"
    )]
    pub history: Option<Vec<ChatMessage>>,
    #[serde(
        default,
        rename = "projectFiles",
        alias = "project_files",
        alias = "fileContext"
    )]
    pub file_context: Option<Vec<String>>,
    /// Caller-supplied id, only used to correlate log lines.
    #[serde(default, rename = "correlationId", alias = "correlation_id")]
    pub correlation_id: Option<String>,
}

#[cfg(test)]
impl GenerationRequest {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::default()
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn files(mut self, files: Vec<String>) -> Self {
        self.file_context = Some(files);
        self
    }
}

/// Item of the caller-facing stream.  `Done` is always the last item and
/// appears exactly once, whatever ended the generation.
#[derive(Debug)]
pub enum GenerationEvent {
    Token(String),
    Failed(InferError),
    Done,
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/// What the background task hands to the consumer.
type Fragment = Result<String>;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub system_prompt: String,
    pub channel_capacity: usize,
    pub stop_join_timeout: Duration,
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            channel_capacity: config.generation.channel_capacity.max(1),
            stop_join_timeout: Duration::from_millis(config.generation.stop_join_timeout_ms),
        }
    }
}

/// Runs streaming generations against the shared model, at most one per
/// conversation.
pub struct GenerationCoordinator {
    gateway: Arc<dyn ModelGateway>,
    registry: Arc<SessionRegistry>,
    options: CoordinatorOptions,
    sampling: SamplingParams,
}

impl GenerationCoordinator {
    pub fn new(gateway: Arc<dyn ModelGateway>, options: CoordinatorOptions) -> Self {
        Self {
            gateway,
            registry: Arc::new(SessionRegistry::new()),
            options,
            sampling: SamplingParams::default(),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ModelGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a generation and return the stream of its output.
    ///
    /// Input errors are returned before anything is allocated.  Any
    /// generation already running for the same conversation is stopped
    /// first.
    pub async fn start(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let GenerationRequest {
            conversation_id,
            prompt,
            history,
            file_context,
            correlation_id,
        } = request;

        debug!(
            conversation_id = ?conversation_id,
            correlation_id = correlation_id.as_deref().unwrap_or("-"),
            prompt_len = prompt.as_deref().map_or(0, str::len),
            history = history.as_ref().map_or(0, Vec::len),
            files = file_context.as_ref().map_or(0, Vec::len),
            "generate requested"
        );

        let resolved = prompt::resolve(prompt.as_deref(), history.unwrap_or_default())?;
        let conversation_id = conversation_id.ok_or(InferError::MissingConversationId)?;
        let file_context = file_context.unwrap_or_default();

        // Templating and tokenization may be slow for real tokenizers.
        let gateway = Arc::clone(&self.gateway);
        let system_prompt = self.options.system_prompt.clone();
        let (full_prompt, prompt_tokens) = tokio::task::spawn_blocking(move || {
            let text = prompt::build(gateway.as_ref(), &system_prompt, &resolved, &file_context);
            let tokens = gateway.count_tokens(&text)?;
            Ok::<_, InferError>((text, tokens))
        })
        .await
        .map_err(|e| InferError::Generation(format!("prompt task join error: {e}")))??;

        let context_window = self.gateway.context_window();
        let budget = model::generation_budget(context_window, prompt_tokens);
        if prompt_tokens >= context_window {
            warn!(
                conversation_id,
                prompt_tokens,
                context_window,
                "prompt fills the context window, generating a single token"
            );
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Fragment>(self.options.channel_capacity);
        let handle = GenerationHandle::new(conversation_id, cancel.clone());
        let session = handle.session;

        let previous = self.registry.register(handle);

        // Owns the new entry from here on: if this future is dropped at any
        // later await, the guard removes it.
        let guard = SessionGuard {
            conversation_id,
            session,
            cancel: cancel.clone(),
            registry: Arc::clone(&self.registry),
            join_timeout: self.options.stop_join_timeout,
            released: false,
        };

        if let Some(previous) = previous {
            info!(
                conversation_id,
                previous = %previous.session,
                "stopping previous generation"
            );
            release(previous, self.options.stop_join_timeout).await;
        }

        let task = tokio::task::spawn_blocking({
            let gateway = Arc::clone(&self.gateway);
            let sampling = self.sampling.clone();
            let cancel = cancel.clone();
            move || {
                run_generation(
                    gateway.as_ref(),
                    &full_prompt,
                    budget,
                    &sampling,
                    &cancel,
                    &tx,
                );
            }
        });

        if self.registry.attach_task(conversation_id, session, task).is_err() {
            // Stopped between registration and launch; the token is already
            // cancelled so the task exits at its first step.
            debug!(conversation_id, session = %session, "session stopped before launch");
        }

        info!(
            conversation_id,
            session = %session,
            prompt_tokens,
            budget,
            "generation started"
        );

        Ok(Box::pin(relay(rx, cancel, guard)))
    }

    /// Stop the generation for `conversation_id`, if any.  Unknown ids are
    /// a no-op.
    pub async fn stop(&self, conversation_id: ConversationId) {
        match self.registry.remove(conversation_id) {
            Some(handle) => {
                info!(conversation_id, session = %handle.session, "stopping generation");
                release(handle, self.options.stop_join_timeout).await;
            }
            None => debug!(conversation_id, "stop requested, no active generation"),
        }
    }

    /// Stop every active generation (used on shutdown).
    pub async fn stop_all(&self) {
        if self.registry.is_empty() {
            return;
        }
        info!(active = self.registry.len(), "stopping all generations");
        for conversation_id in self.registry.active_ids() {
            self.stop(conversation_id).await;
        }
    }
}

/// Body of the background task: drive the model and forward fragments.
fn run_generation(
    gateway: &dyn ModelGateway,
    prompt: &str,
    budget: usize,
    sampling: &SamplingParams,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Fragment>,
) {
    let should_stop = || cancel.is_cancelled();
    // Blocks while the channel is full; fails once the consumer is gone.
    let mut forward = |fragment: String| tx.blocking_send(Ok(fragment)).is_ok();

    match gateway.generate(prompt, budget, sampling, &should_stop, &mut forward) {
        Ok(()) => debug!("generation finished"),
        Err(InferError::CancelledByCaller) => debug!("generation cancelled"),
        Err(e) => {
            warn!(err = %e, "generation failed");
            if tx.blocking_send(Err(e)).is_err() {
                debug!("consumer gone before the failure could be delivered");
            }
        }
    }
}

/// Consumer side: relay fragments until the producer finishes, fails, or
/// the session is cancelled, release the session, then emit `Done`.
fn relay(
    mut rx: mpsc::Receiver<Fragment>,
    cancel: CancellationToken,
    guard: SessionGuard,
) -> impl Stream<Item = GenerationEvent> + Send {
    async_stream::stream! {
        let mut guard = guard;
        let mut failure = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = rx.recv() => Some(item),
            };

            match next {
                Some(Some(Ok(fragment))) => yield GenerationEvent::Token(fragment),
                Some(Some(Err(e))) => {
                    failure = Some(e);
                    break;
                }
                Some(None) => {
                    debug!(conversation_id = guard.conversation_id, "stream complete");
                    break;
                }
                None => {
                    rx.close();
                    debug!(conversation_id = guard.conversation_id, "stream stopped");
                    break;
                }
            }
        }

        guard.release().await;

        if let Some(e) = failure {
            yield GenerationEvent::Failed(e);
        }
        yield GenerationEvent::Done;
    }
}

/// Ties a consumer stream to its registry entry.  Released explicitly when
/// the stream ends, or on drop when the consumer abandons it.
struct SessionGuard {
    conversation_id: ConversationId,
    session: Uuid,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    join_timeout: Duration,
    released: bool,
}

impl SessionGuard {
    async fn release(&mut self) {
        if let Some(handle) = self.take() {
            release(handle, self.join_timeout).await;
        }
    }

    /// Claim this session's registry entry.  `None` when it was already
    /// released, stopped, or replaced by a newer generation.
    fn take(&mut self) -> Option<GenerationHandle> {
        if self.released {
            return None;
        }
        self.released = true;
        self.cancel.cancel();
        self.registry.remove_session(self.conversation_id, self.session)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.take() else {
            return;
        };

        debug!(
            conversation_id = self.conversation_id,
            session = %self.session,
            "stream abandoned, releasing session"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(release(handle, self.join_timeout));
            }
            // No runtime to wait on; the task is already cancelled and
            // dropping its handle detaches it.
            Err(_) => drop(handle),
        }
    }
}

/// Release a generation that has been removed from the registry: signal
/// cancellation and wait (bounded) for the background task.
///
/// Stop requests, replacement by a newer generation, and stream completion
/// all end up here.
async fn release(mut handle: GenerationHandle, join_timeout: Duration) {
    handle.cancel.cancel();

    let Some(task) = handle.task.take() else {
        return;
    };

    match tokio::time::timeout(join_timeout, task).await {
        Ok(Ok(())) => debug!(
            conversation_id = handle.conversation_id,
            session = %handle.session,
            "generation task exited"
        ),
        Ok(Err(e)) => warn!(
            conversation_id = handle.conversation_id,
            session = %handle.session,
            err = %e,
            "generation task panicked"
        ),
        Err(_) => debug!(
            conversation_id = handle.conversation_id,
            session = %handle.session,
            "generation task still running after stop timeout, detaching"
        ),
    }
}
