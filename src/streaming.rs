//! SSE reader for streaming chat completions.
//!
//! The streaming wire path reads the response body as server-sent events,
//! concatenating `delta.content` and `delta.reasoning_content` into two
//! separate buffers until the `data: [DONE]` terminator. Token usage is
//! not available in this mode and is reported as zero.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt as _};

use crate::{
    client::{ApiError, ChatResponse},
    prelude::*,
    wire::StreamingChunk,
};

/// Drain a streaming response into a single [`ChatResponse`].
pub async fn drain(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<ChatResponse, ApiError> {
    drain_events(response.bytes_stream(), cancel).await
}

/// The transport-agnostic core of [`drain`], so tests can feed it
/// fabricated byte streams.
pub async fn drain_events<S, B, E>(
    bytes: S,
    cancel: &CancellationToken,
) -> Result<ChatResponse, ApiError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error,
{
    let mut events = std::pin::pin!(bytes.eventsource());
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::cancelled()),
            event = events.next() => event,
        };
        let event = match event {
            None => break,
            Some(Err(err)) => {
                return Err(ApiError::retryable(format!("SSE stream error: {}", err)));
            }
            Some(Ok(event)) => event,
        };
        if event.data == "[DONE]" {
            break;
        }
        let chunk: StreamingChunk = serde_json::from_str(&event.data).map_err(|err| {
            ApiError::retryable(format!(
                "unparseable SSE frame: {} (frame: {:?})",
                err, event.data
            ))
        })?;
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta.content {
                content.push_str(&delta);
            }
            if let Some(delta) = choice.delta.reasoning_content {
                reasoning.push_str(&delta);
            }
            if choice.finish_reason.is_some() {
                finish_reason = choice.finish_reason;
            }
        }
    }

    Ok(ChatResponse {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        finish_reason,
        usage: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn frames(lines: &[&str]) -> Vec<Result<Vec<u8>, Infallible>> {
        lines
            .iter()
            .map(|line| Ok(format!("data: {}\n\n", line).into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_drain_concatenates_content_and_reasoning() {
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(frames(&[
            r#"{"choices":[{"delta":{"reasoning_content":"hm"}}]}"#,
            r#"{"choices":[{"delta":{"reasoning_content":"m."}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":", world"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]));
        let response = drain_events(stream, &cancel).await.unwrap();
        assert_eq!(response.content, "Hello, world");
        assert_eq!(response.reasoning.as_deref(), Some("hmm."));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_drain_stops_at_done_terminator() {
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(frames(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"ignored"}}]}"#,
        ]));
        let response = drain_events(stream, &cancel).await.unwrap();
        assert_eq!(response.content, "a");
    }

    #[tokio::test]
    async fn test_drain_rejects_garbage_frames_as_retryable() {
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(frames(&["this is not json"]));
        let err = drain_events(stream, &cancel).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_drain_handles_end_without_done() {
        let cancel = CancellationToken::new();
        let stream =
            futures::stream::iter(frames(&[r#"{"choices":[{"delta":{"content":"x"}}]}"#]));
        let response = drain_events(stream, &cancel).await.unwrap();
        assert_eq!(response.content, "x");
    }
}
