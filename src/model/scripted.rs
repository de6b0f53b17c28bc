//! Deterministic gateway used by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{ModelGateway, SamplingParams};
use crate::error::{InferError, Result};
use crate::session::prompt::ChatMessage;

/// Upper bound on how long a held generation waits for a stop request, so a
/// broken test fails instead of hanging.
const HOLD_LIMIT: Duration = Duration::from_secs(10);

pub struct ScriptedGateway {
    tokens: Vec<String>,
    context_window: usize,
    hold_until_stopped: bool,
    stop_latency: Duration,
    fail_at: Option<usize>,
    chat_template: bool,
    calls: AtomicUsize,
    last_budget: AtomicUsize,
    last_prompt: Mutex<String>,
    cancelled_runs: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            context_window: 2048,
            hold_until_stopped: false,
            stop_latency: Duration::ZERO,
            fail_at: None,
            chat_template: false,
            calls: AtomicUsize::new(0),
            last_budget: AtomicUsize::new(0),
            last_prompt: Mutex::new(String::new()),
            cancelled_runs: AtomicUsize::new(0),
        }
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// After the scripted tokens, keep decoding (silently) until stopped.
    pub fn hold_until_stopped(mut self) -> Self {
        self.hold_until_stopped = true;
        self
    }

    /// Keep running for `latency` after the stop flag is first seen while
    /// holding.
    pub fn with_stop_latency(mut self, latency: Duration) -> Self {
        self.stop_latency = latency;
        self
    }

    /// Fail with a generation error before emitting token `step`.
    pub fn fail_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn with_chat_template(mut self) -> Self {
        self.chat_template = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_budget(&self) -> usize {
        self.last_budget.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone()
    }

    pub fn cancelled_runs(&self) -> usize {
        self.cancelled_runs.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> Result<()> {
        self.cancelled_runs.fetch_add(1, Ordering::SeqCst);
        Err(InferError::CancelledByCaller)
    }
}

impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(text.split_whitespace().count())
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String> {
        if !self.chat_template {
            return None;
        }
        let mut out = String::new();
        for msg in messages {
            let role = msg.role.label().to_lowercase();
            out.push_str(&format!("<{role}>{}</{role}>", msg.content));
        }
        out.push_str("<assistant>");
        Some(out)
    }

    fn generate(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        _sampling: &SamplingParams,
        should_stop: &dyn Fn() -> bool,
        on_fragment: &mut dyn FnMut(String) -> bool,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_budget.store(max_new_tokens, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = prompt.to_string();

        for (step, token) in self.tokens.iter().take(max_new_tokens).enumerate() {
            if should_stop() {
                return self.cancelled();
            }
            if self.fail_at == Some(step) {
                return Err(InferError::Generation(format!("scripted failure at step {step}")));
            }
            if !on_fragment(token.clone()) {
                return Ok(());
            }
        }

        if self.hold_until_stopped {
            let started = Instant::now();
            while started.elapsed() < HOLD_LIMIT {
                if should_stop() {
                    std::thread::sleep(self.stop_latency);
                    return self.cancelled();
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        Ok(())
    }
}
