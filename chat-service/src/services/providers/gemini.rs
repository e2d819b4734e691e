//! Gemini AI provider implementation.
//!
//! Streams text from `streamGenerateContent` with `alt=sse`. The response
//! body is decoded incrementally and forwarded through a bounded channel by a
//! producer task that stops as soon as the consumer goes away.

use super::{
    FinishReason, GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Gemini API base URL.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_HEADER: &str = "x-goog-api-key";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 32;

/// Gemini provider configuration.
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Gemini text provider.
pub struct GeminiTextProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiTextProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }

        // No whole-request timeout: a long generation must not be cut off.
        // Stalls are bounded by the relay's inactivity timeout instead.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    /// Build the API URL for the given model and method.
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.model,
            method
        )
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(prompt)],
            }],
            system_instruction: params.system_instruction.as_deref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text)],
            }),
            generation_config: Some(GenerationConfig {
                thinking_config: params.thinking_budget.map(|thinking_budget| ThinkingConfig {
                    thinking_budget,
                }),
            }),
        }
    }
}

#[async_trait]
impl TextProvider for GeminiTextProvider {
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        let request = self.build_request(prompt, params);
        let url = format!("{}?alt=sse", self.api_url("streamGenerateContent"));

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            thinking_budget = ?params.thinking_budget,
            "Starting streaming request to Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited);
            }

            return Err(ProviderError::ApiError(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(forward_events(response.bytes_stream(), tx));

        Ok(Box::pin(ReceiverStream::new(rx)) as ProviderStream)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!(
            "{}/models/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }
}

/// Decode a Gemini SSE body and forward its chunks to `tx`.
///
/// Ends with exactly one terminal item: a `Complete` chunk or an error.
/// Returns early, dropping `body`, once the receiver is gone.
async fn forward_events<S, B, E>(body: S, tx: mpsc::Sender<Result<StreamChunk, ProviderError>>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    tokio::pin!(body);
    let mut decoder = SseDecoder::default();
    let mut tally = StreamTally::default();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Stream consumer dropped, releasing Gemini connection");
                return;
            }
            next = body.next() => next,
        };

        let (payloads, exhausted) = match next {
            Some(Ok(bytes)) => (decoder.push(bytes.as_ref()), false),
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(ProviderError::NetworkError(e.to_string())))
                    .await;
                return;
            }
            None => (decoder.finish().map(|tail| tail.into_iter().collect()), true),
        };

        let payloads = match payloads {
            Ok(payloads) => payloads,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for payload in payloads {
            let text = match tally.apply(&payload) {
                Ok(text) => text,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if let Some(text) = text {
                if tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                    return;
                }
            }
            // Text carried by a filtered candidate is delivered first.
            if tally.is_filtered() {
                let _ = tx.send(Err(ProviderError::ContentFiltered)).await;
                return;
            }
        }

        if exhausted {
            break;
        }
    }

    let _ = tx.send(tally.finish()).await;
}

// ============================================================================
// SSE decoding
// ============================================================================

/// Incremental decoder for a `text/event-stream` body.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks are never decoded in halves.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes and return the `data` payload of every completed event.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&event[..end])? {
                payloads.push(data);
            }
        }
        Ok(payloads)
    }

    /// Flush a trailing event that was not terminated by a blank line.
    fn finish(&mut self) -> Result<Option<String>, ProviderError> {
        let event = std::mem::take(&mut self.buffer);
        event_data(&event)
    }
}

/// Join the `data` lines of one event. Anything that is not an SSE line
/// means the body is not an event stream.
fn event_data(event: &[u8]) -> Result<Option<String>, ProviderError> {
    let event = String::from_utf8_lossy(event);
    let mut lines = Vec::new();

    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if !is_ignored_line(line) {
            return Err(ProviderError::ApiError(format!(
                "Unexpected line in Gemini event stream: {}",
                line.chars().take(120).collect::<String>()
            )));
        }
    }

    Ok((!lines.is_empty()).then(|| lines.join("\n")))
}

fn is_ignored_line(line: &str) -> bool {
    line.trim().is_empty()
        || line.starts_with(':')
        || ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
}

/// Running totals for one stream.
#[derive(Debug, Default)]
struct StreamTally {
    input_tokens: i32,
    output_tokens: i32,
    finish_reason: Option<FinishReason>,
}

impl StreamTally {
    /// Interpret one event payload, returning its visible text if any.
    fn apply(&mut self, payload: &str) -> Result<Option<String>, ProviderError> {
        let response: GenerateContentResponse = serde_json::from_str(payload).map_err(|e| {
            ProviderError::ApiError(format!("Malformed Gemini stream event: {}", e))
        })?;

        if let Some(error) = response.error {
            return Err(ProviderError::ApiError(format!(
                "Gemini stream error {}: {}",
                error.code.unwrap_or_default(),
                error.message.unwrap_or_default()
            )));
        }

        if let Some(usage) = &response.usage_metadata {
            self.input_tokens = usage.prompt_token_count.unwrap_or(self.input_tokens);
            self.output_tokens = usage.candidates_token_count.unwrap_or(self.output_tokens);
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            if response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .is_some()
            {
                return Err(ProviderError::ContentFiltered);
            }
            return Ok(None);
        };

        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = Some(FinishReason::from_api(reason));
        }

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought.unwrap_or(false))
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        Ok((!text.is_empty()).then_some(text))
    }

    /// The candidate was stopped by a safety filter.
    fn is_filtered(&self) -> bool {
        self.finish_reason == Some(FinishReason::ContentFilter)
    }

    /// Final chunk once the body is exhausted. A body that ends before any
    /// finish reason was cut short.
    fn finish(&self) -> Result<StreamChunk, ProviderError> {
        match self.finish_reason {
            Some(finish_reason) => Ok(StreamChunk::Complete {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                finish_reason,
            }),
            None => Err(ProviderError::ApiError(
                "Gemini stream ended without a finish reason".to_string(),
            )),
        }
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            thought: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiTextProvider {
        GeminiTextProvider::new(GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_base: format!("{}/", GEMINI_API_BASE),
        })
        .unwrap()
    }

    #[test]
    fn rejects_missing_api_key() {
        let result = GeminiTextProvider::new(GeminiConfig {
            api_key: String::new(),
            model: "gemini-2.5-flash".to_string(),
            api_base: GEMINI_API_BASE.to_string(),
        });
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn api_url_does_not_carry_the_key() {
        let url = provider().api_url("streamGenerateContent");
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent"
        );
        assert!(!url.contains("test-key"));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let rendered = format!("{:?}", provider().config);
        assert!(!rendered.contains("test-key"));
    }

    #[test]
    fn request_carries_system_instruction_and_thinking_budget() {
        let params = GenerationParams {
            system_instruction: Some("you are a vet assistant".to_string()),
            thinking_budget: Some(0),
            ..Default::default()
        };
        let body = serde_json::to_value(provider().build_request("My dog is vomiting", &params))
            .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "contents": [{ "role": "user", "parts": [{ "text": "My dog is vomiting" }] }],
                "systemInstruction": { "parts": [{ "text": "you are a vet assistant" }] },
                "generationConfig": { "thinkingConfig": { "thinkingBudget": 0 } }
            })
        );
    }

    #[test]
    fn decoder_handles_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").unwrap().is_empty());
        let payloads = decoder.push(b"1}\r\n\r\ndata: {\"b\":2}\r\n\r\n").unwrap();
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let mut decoder = SseDecoder::default();
        let event = "data: {\"text\":\"ü\"}\n\n".as_bytes();
        let split = event.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&event[..split]).unwrap().is_empty());
        assert_eq!(
            decoder.push(&event[split..]).unwrap(),
            vec!["{\"text\":\"ü\"}"]
        );
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap().as_deref(), Some("tail"));
        assert_eq!(decoder.finish().unwrap(), None);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder
            .push(b": keep-alive\n\nevent: message\nid: 7\ndata: {}\n\n")
            .unwrap();
        assert_eq!(payloads, vec!["{}"]);
    }

    #[test]
    fn decoder_rejects_a_body_that_is_not_an_event_stream() {
        let mut decoder = SseDecoder::default();
        assert!(decoder
            .push(br#"[{"error":{"code":400,"message":"bad"}}]"#)
            .unwrap()
            .is_empty());
        assert!(matches!(decoder.finish(), Err(ProviderError::ApiError(_))));
    }

    #[test]
    fn tally_extracts_text_and_usage() {
        let mut tally = StreamTally::default();
        let text = tally
            .apply(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"It "},{"text":"could"}]}}],
                   "usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":2}}"#,
            )
            .unwrap();
        assert_eq!(text.as_deref(), Some("It could"));

        let last = tally
            .apply(r#"{"candidates":[{"content":{"parts":[{"text":""}]},"finishReason":"STOP"}]}"#)
            .unwrap();
        assert_eq!(last, None);
        assert_eq!(
            tally.finish().unwrap(),
            StreamChunk::Complete {
                input_tokens: 7,
                output_tokens: 2,
                finish_reason: FinishReason::Complete,
            }
        );
    }

    #[test]
    fn tally_skips_thought_parts() {
        let mut tally = StreamTally::default();
        let text = tally
            .apply(r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true},{"text":"Answer"}]}}]}"#)
            .unwrap();
        assert_eq!(text.as_deref(), Some("Answer"));
    }

    #[test]
    fn tally_keeps_text_of_a_safety_stopped_candidate() {
        let mut tally = StreamTally::default();
        let text = tally
            .apply(r#"{"candidates":[{"content":{"parts":[{"text":"Take your dog to a vet."}]},"finishReason":"SAFETY"}]}"#)
            .unwrap();
        assert_eq!(text.as_deref(), Some("Take your dog to a vet."));
        assert!(tally.is_filtered());
    }

    #[test]
    fn tally_reports_blocked_prompt_as_content_filtered() {
        let mut tally = StreamTally::default();
        let result = tally.apply(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert!(matches!(result, Err(ProviderError::ContentFiltered)));
    }

    #[test]
    fn tally_surfaces_in_stream_api_errors() {
        let mut tally = StreamTally::default();
        let result = tally.apply(r#"{"error":{"code":503,"message":"overloaded"}}"#);
        match result {
            Err(ProviderError::ApiError(msg)) => assert!(msg.contains("overloaded")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn tally_rejects_malformed_events() {
        let mut tally = StreamTally::default();
        let result = tally.apply(r#"{"candidates":[{"content":{"parts":[{"text":"It cou"#);
        assert!(matches!(result, Err(ProviderError::ApiError(_))));
    }

    #[test]
    fn tally_without_finish_reason_is_cut_short() {
        let mut tally = StreamTally::default();
        tally
            .apply(r#"{"candidates":[{"content":{"parts":[{"text":"It"}]}}]}"#)
            .unwrap();
        assert!(matches!(tally.finish(), Err(ProviderError::ApiError(_))));
    }

    async fn forward(parts: Vec<&'static str>) -> Vec<Result<StreamChunk, ProviderError>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let body = futures::stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
        forward_events(body, tx).await;
        ReceiverStream::new(rx).collect().await
    }

    #[tokio::test]
    async fn forwards_text_then_completion() {
        let chunks = forward(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"It \"}]}}]}\n\ndata: {\"cand",
            "idates\":[{\"content\":{\"parts\":[{\"text\":\"could\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2}}\n\n",
        ])
        .await;

        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("It ".to_string()),
                StreamChunk::Text("could".to_string()),
                StreamChunk::Complete {
                    input_tokens: 3,
                    output_tokens: 2,
                    finish_reason: FinishReason::Complete,
                },
            ]
        );
    }

    #[tokio::test]
    async fn safety_stop_delivers_text_before_the_error() {
        let chunks = forward(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Take your dog to a vet.\"}]},\"finishReason\":\"SAFETY\"}]}\n\n",
        ])
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Text(t)) if t == "Take your dog to a vet."));
        assert!(matches!(chunks[1], Err(ProviderError::ContentFiltered)));
    }

    #[tokio::test]
    async fn truncated_event_ends_in_an_error() {
        let chunks = forward(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"It cou",
        ])
        .await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(ProviderError::ApiError(_))));
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let body = futures::stream::iter(vec![
            Ok("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}\n\n"),
            Err(std::io::Error::other("connection reset")),
        ]);
        forward_events(body, tx).await;
        let chunks: Vec<_> = ReceiverStream::new(rx).collect().await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(ProviderError::NetworkError(_))));
    }
}
