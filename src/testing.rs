//! Testing utilities including a scripted model client.
//!
//! These are useful for testing applications that use the pipeline without
//! making real model calls.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::client::{ModelClient, ModelReply, ModelRequest};
use crate::error::DispatchError;
use crate::output::TokenUsage;

type Scripted = Result<String, DispatchError>;

struct Rule {
    needle: String,
    replies: Mutex<VecDeque<Scripted>>,
}

/// A [`ModelClient`] that replays scripted replies.
///
/// Replies are chosen in this order:
/// 1. the first rule whose needle occurs in the request's prompt or system
///    text (its last reply repeats once the others are used up),
/// 2. the global queue, in order,
/// 3. the fallback reply.
///
/// With nothing left, the call fails with a permanent error. Every request
/// is recorded for assertions.
#[derive(Default)]
pub struct ScriptedClient {
    rules: Vec<Rule>,
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    delay: Option<Duration>,
    usage: TokenUsage,
    calls: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(Ok(text.into()));
        self
    }

    /// Queue a failed call.
    pub fn fail(self, error: DispatchError) -> Self {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(error));
        self
    }

    /// Reply used whenever no rule matches and the queue is empty.
    pub fn fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(Ok(text.into()));
        self
    }

    /// Replies for requests whose prompt or system text contains `needle`.
    pub fn on_prompt_containing(mut self, needle: impl Into<String>, replies: Vec<Scripted>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            replies: Mutex::new(replies.into()),
        });
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Token usage reported on every successful reply.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// All requests received so far.
    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Requests whose prompt contains `needle`.
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.prompt.contains(needle))
            .count()
    }

    fn next_reply(&self, request: &ModelRequest) -> Scripted {
        for rule in &self.rules {
            if request.prompt.contains(&rule.needle) || request.system.contains(&rule.needle) {
                let mut replies = rule.replies.lock().unwrap_or_else(PoisonError::into_inner);
                let next = if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                };
                if let Some(next) = next {
                    return next;
                }
            }
        }
        if let Some(next) = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .unwrap_or_else(|| Err(DispatchError::Permanent("no scripted reply left".into())))
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, DispatchError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(request.clone());
        let scripted = self.next_reply(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        scripted.map(|content| ModelReply {
            content,
            usage: self.usage,
        })
    }
}
