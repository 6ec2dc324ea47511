//! Offline stand-ins for pipeline tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crate::{
    client::{ApiError, ChatResponse, CompletionApi},
    config::ModelConfig,
    prelude::*,
    wire::ChatMessage,
};

/// A record of one call the fake received.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub model: String,
    pub structured: bool,
    /// The content of the last user message.
    pub user_message: String,
}

/// A [`CompletionApi`] driven entirely by a pre-loaded script. Responses
/// are queued per `(model name, structured)` pair and popped in order, so
/// tests stay deterministic without any network.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    queues: Mutex<HashMap<(String, bool), VecDeque<Result<String, ApiError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, model: &str, structured: bool, response: &str) {
        self.push(model, structured, Ok(response.to_owned()));
    }

    pub fn push_err(&self, model: &str, structured: bool, err: ApiError) {
        self.push(model, structured, Err(err));
    }

    fn push(&self, model: &str, structured: bool, entry: Result<String, ApiError>) {
        let mut queues = self.queues.lock().expect("lock poisoned");
        queues
            .entry((model.to_owned(), structured))
            .or_default()
            .push_back(entry);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock poisoned").len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    fn respond(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        structured: bool,
    ) -> Result<ChatResponse, ApiError> {
        let user_message = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.calls.lock().expect("lock poisoned").push(RecordedCall {
            model: spec.name.clone(),
            structured,
            user_message,
        });

        let mut queues = self.queues.lock().expect("lock poisoned");
        let entry = queues
            .get_mut(&(spec.name.clone(), structured))
            .and_then(VecDeque::pop_front);
        match entry {
            Some(Ok(content)) => Ok(ChatResponse {
                content,
                ..Default::default()
            }),
            Some(Err(err)) => Err(err),
            None => Err(ApiError::terminal(format!(
                "script exhausted for model {:?} (structured = {})",
                spec.name, structured
            ))),
        }
    }
}

#[async_trait]
impl CompletionApi for ScriptedApi {
    async fn chat_completion(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError> {
        self.respond(spec, messages, false)
    }

    async fn chat_completion_structured(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError> {
        self.respond(spec, messages, true)
    }
}
