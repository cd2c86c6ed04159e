//! HTTP client for OpenAI-compatible chat completion APIs.
//!
//! Streams `/v1/chat/completions` over SSE and maps each chunk onto
//! [`StreamEvent`]s. 429 and 5xx responses are retried with backoff.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::{Value, json};

use crate::config::{Config, RetryPolicy};
use crate::llm_client::{LlmClient, LlmError, RequestOptions, StreamEvent, StreamEventBox};
use crate::logging;
use crate::models::{InputPart, InputRole, ModelInputItem, Usage};

// === Types ===

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct ChatClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    retry: RetryPolicy,
}

impl ChatClient {
    /// Create a client from CLI configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.api_key()?;
        let base_url = config.base_url();
        let retry = config.retry_policy();

        logging::info(format!("Model base URL: {base_url}"));
        logging::info(format!(
            "Retry policy: enabled={}, max_retries={}, initial_delay={}s, max_delay={}s",
            retry.enabled, retry.max_retries, retry.initial_delay, retry.max_delay
        ));

        Self::with_base_url(&api_key, base_url, config.model(), retry)
    }

    /// Create a client against an explicit endpoint.
    pub fn with_base_url(
        api_key: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .context("API key contains characters not allowed in a header")?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            retry,
        })
    }

    fn request_body(
        &self,
        input: &[ModelInputItem],
        system: &str,
        options: &RequestOptions,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_chat_messages(input, system),
            "max_tokens": options.max_output_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

// === Trait Implementations ===

#[async_trait]
impl LlmClient for ChatClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        input: &[ModelInputItem],
        system: &str,
        options: &RequestOptions,
    ) -> Result<StreamEventBox, LlmError> {
        let body = self.request_body(input, system, options);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response =
            send_with_retry(&self.retry, || self.http_client.post(&url).json(&body)).await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let error_text = response.text().await.unwrap_or_default();
            return Err(match LlmError::from_http_response(status.as_u16(), &error_text) {
                LlmError::RateLimited { message, .. } => LlmError::RateLimited {
                    message,
                    retry_after,
                },
                other => other,
            });
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            let mut decoder = SseDecoder::default();
            let mut usage = Usage::default();
            let mut byte_stream = std::pin::pin!(byte_stream);
            let mut eof = false;
            let mut done = false;

            'read: while !eof {
                let payloads = match byte_stream.next().await {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => {
                        yield Err(LlmError::StreamError(format!("Stream read error: {e}")));
                        return;
                    }
                    None => {
                        eof = true;
                        decoder.finish()
                    }
                };

                for data in payloads {
                    if data.trim() == "[DONE]" {
                        done = true;
                        break 'read;
                    }
                    let Ok(chunk_json) = serde_json::from_str::<Value>(&data) else {
                        logging::warn(format!(
                            "Skipping malformed SSE chunk: {}",
                            crate::utils::truncate_with_ellipsis(&data, 200, "...")
                        ));
                        continue;
                    };
                    match parse_sse_chunk(&chunk_json, &mut usage) {
                        Ok(events) => {
                            for event in events {
                                yield Ok(event);
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }
            }

            if !done {
                yield Err(LlmError::StreamError(
                    "Stream closed before [DONE]; the response is incomplete".to_string(),
                ));
                return;
            }
            yield Ok(StreamEvent::Finish(usage));
        };

        Ok(Box::pin(stream))
    }
}

// === Request Helpers ===

fn role_name(role: InputRole) -> &'static str {
    match role {
        InputRole::System => "system",
        InputRole::User => "user",
        InputRole::Assistant => "assistant",
    }
}

/// Convert provider-neutral input into chat `messages`.
fn build_chat_messages(input: &[ModelInputItem], system: &str) -> Vec<Value> {
    let mut messages = Vec::with_capacity(input.len() + 1);
    if !system.trim().is_empty() {
        messages.push(json!({"role": "system", "content": system}));
    }
    for item in input {
        let has_images = item
            .content
            .iter()
            .any(|part| matches!(part, InputPart::Image { .. }));
        let content = if has_images {
            Value::Array(
                item.content
                    .iter()
                    .map(|part| match part {
                        InputPart::Text { text } => json!({"type": "text", "text": text}),
                        InputPart::Image { data, mime_type } => json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                        }),
                    })
                    .collect(),
            )
        } else {
            Value::String(item.joined_text())
        };
        messages.push(json!({"role": role_name(item.role), "content": content}));
    }
    messages
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// === Streaming Helpers ===

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    byte_buf: BytesMut,
    data_buf: String,
}

impl SseDecoder {
    /// Feed bytes; returns every event payload completed by them.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline_pos) = self.byte_buf.iter().position(|b| *b == b'\n') {
            let raw = self.byte_buf.split_to(newline_pos + 1);
            self.feed_line(&String::from_utf8_lossy(&raw), &mut events);
        }
        events
    }

    /// End of input: an unterminated last line or event still counts.
    fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.byte_buf.is_empty() {
            let raw = self.byte_buf.split();
            self.feed_line(&String::from_utf8_lossy(&raw), &mut events);
        }
        if !self.data_buf.is_empty() {
            events.push(std::mem::take(&mut self.data_buf));
        }
        events
    }

    fn feed_line(&mut self, raw: &str, events: &mut Vec<String>) {
        let line = raw.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            // Empty line = event boundary
            if !self.data_buf.is_empty() {
                events.push(std::mem::take(&mut self.data_buf));
            }
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            if !self.data_buf.is_empty() {
                self.data_buf.push('\n');
            }
            self.data_buf.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
        // Ignore other SSE fields (event:, id:, retry:) and comments.
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

/// Map one chunk onto stream events, recording usage when present.
fn parse_sse_chunk(chunk: &Value, usage: &mut Usage) -> Result<Vec<StreamEvent>, LlmError> {
    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(LlmError::StreamError(message));
    }
    if let Some(reported) = chunk.get("usage").filter(|u| u.is_object()) {
        *usage = parse_usage(reported);
    }

    let mut events = Vec::new();
    let Some(delta) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
    else {
        return Ok(events);
    };
    if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str)
        && !reasoning.is_empty()
    {
        events.push(StreamEvent::ReasoningDelta(reasoning.to_string()));
    }
    if let Some(content) = delta.get("content").and_then(Value::as_str)
        && !content.is_empty()
    {
        events.push(StreamEvent::TextDelta(content.to_string()));
    }
    Ok(events)
}

// === Retry Helpers ===

async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        let result = build().send().await;

        match result {
            Ok(response) => {
                let status = response.status();

                // Return successful responses immediately
                if status.is_success() {
                    return Ok(response);
                }

                // Non-retryable errors go back to the caller for mapping
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable {
                    return Ok(response);
                }

                // Retry if policy allows and we haven't exceeded max retries
                if !policy.enabled || attempt >= policy.max_retries {
                    return Ok(response);
                }

                logging::warn(format!(
                    "Retryable HTTP {} (attempt {} of {})",
                    status.as_u16(),
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(err.into());
                }
                logging::warn(format!(
                    "Request error: {} (attempt {} of {})",
                    err,
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay: 0.01,
            max_delay: 0.05,
            ..RetryPolicy::default()
        }
    }

    fn client(server: &MockServer, retry: RetryPolicy) -> ChatClient {
        ChatClient::with_base_url("test-key", server.uri(), "test-model", retry).unwrap()
    }

    fn sse(chunks: &[Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn collect(stream: StreamEventBox) -> Vec<Result<StreamEvent, LlmError>> {
        stream.collect().await
    }

    fn input() -> Vec<ModelInputItem> {
        vec![ModelInputItem::text(InputRole::User, "hello")]
    }

    #[tokio::test]
    async fn streams_text_reasoning_and_usage() {
        let server = MockServer::start().await;
        let body = sse(&[
            json!({"choices": [{"delta": {"reasoning_content": "thinking"}}]}),
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 3}}),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "test-model", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let stream = client(&server, fast_retry())
            .send(&input(), "be brief", &RequestOptions::default())
            .await
            .expect("stream opens");
        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|event| event.expect("event"))
            .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::ReasoningDelta("thinking".to_string()),
                StreamEvent::TextDelta("Hel".to_string()),
                StreamEvent::TextDelta("lo".to_string()),
                StreamEvent::Finish(Usage::new(12, 3)),
            ]
        );
    }

    #[tokio::test]
    async fn auth_failures_are_typed_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, fast_retry())
            .send(&input(), "", &RequestOptions::default())
            .await
            .err()
            .expect("request fails");
        assert!(matches!(err, LlmError::AuthenticationError(ref m) if m.contains("invalid api key")));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    sse(&[json!({"choices": [{"delta": {"content": "ok"}}]})]),
                    "text/event-stream",
                ),
            )
            .mount(&server)
            .await;

        let stream = client(&server, fast_retry())
            .send(&input(), "", &RequestOptions::default())
            .await
            .expect("retry succeeds");
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].as_ref().ok(),
            Some(&StreamEvent::TextDelta("ok".to_string()))
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client(&server, RetryPolicy::disabled())
            .send(&input(), "", &RequestOptions::default())
            .await
            .err()
            .expect("request fails");
        assert_eq!(
            err,
            LlmError::RateLimited {
                message: "HTTP 429".to_string(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn in_stream_errors_end_the_stream() {
        let server = MockServer::start().await;
        let body = sse(&[
            json!({"choices": [{"delta": {"content": "par"}}]}),
            json!({"error": {"message": "upstream overloaded"}}),
        ]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = client(&server, fast_retry())
            .send(&input(), "", &RequestOptions::default())
            .await
            .expect("stream opens");
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            Err(LlmError::StreamError("upstream overloaded".to_string()))
        );
    }

    #[test]
    fn decoder_handles_split_lines_and_multiline_data() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\r\n").is_empty());
        assert_eq!(decoder.push(b"\r\n"), vec!["{\"a\":1}".to_string()]);

        let events = decoder.push(b": keep-alive\nevent: x\ndata: one\ndata: two\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn decoder_flushes_an_unterminated_tail() {
        let mut decoder = SseDecoder::default();
        assert_eq!(
            decoder.push(b"data: {\"a\":1}\n\ndata: [DO"),
            vec!["{\"a\":1}".to_string()]
        );
        assert_eq!(decoder.finish(), vec!["[DO".to_string()]);

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: last\n").is_empty());
        assert_eq!(decoder.finish(), vec!["last".to_string()]);
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn truncated_streams_are_errors_not_finishes() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}",
            json!({"choices": [{"delta": {"content": "half an ans"}}]}),
            json!({"choices": [{"delta": {"content": "wer"}}]}),
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = client(&server, fast_retry())
            .send(&input(), "", &RequestOptions::default())
            .await
            .expect("stream opens");
        let events = collect(stream).await;
        assert_eq!(
            events[..2],
            [
                Ok(StreamEvent::TextDelta("half an ans".to_string())),
                Ok(StreamEvent::TextDelta("wer".to_string())),
            ]
        );
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], Err(LlmError::StreamError(m)) if m.contains("[DONE]")));
    }

    #[tokio::test]
    async fn done_without_a_trailing_blank_line_still_finishes() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: [DONE]",
            json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 2}}),
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = client(&server, fast_retry())
            .send(&input(), "", &RequestOptions::default())
            .await
            .expect("stream opens");
        let events = collect(stream).await;
        assert_eq!(events, vec![Ok(StreamEvent::Finish(Usage::new(7, 2)))]);
    }

    #[test]
    fn chat_messages_put_the_system_prompt_first() {
        let input = vec![
            ModelInputItem::text(InputRole::User, "hi"),
            ModelInputItem {
                role: InputRole::User,
                content: vec![
                    InputPart::Text {
                        text: "look".to_string(),
                    },
                    InputPart::Image {
                        data: "AAAA".to_string(),
                        mime_type: "image/png".to_string(),
                    },
                ],
            },
            ModelInputItem::text(InputRole::Assistant, "sure"),
        ];
        let messages = build_chat_messages(&input, "system text");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], json!({"role": "system", "content": "system text"}));
        assert_eq!(messages[1], json!({"role": "user", "content": "hi"}));
        assert_eq!(
            messages[2]["content"][1]["image_url"]["url"],
            json!("data:image/png;base64,AAAA")
        );
        assert_eq!(messages[3]["role"], json!("assistant"));

        assert_eq!(build_chat_messages(&input[..1], "  ").len(), 1);
    }
}
