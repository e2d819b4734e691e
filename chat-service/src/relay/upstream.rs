//! Relay-side view of a provider stream.
//!
//! [`DeltaStream`] turns a [`ProviderStream`] into a fused sequence of
//! non-empty text deltas, bounds every pull with an inactivity timeout and
//! tags failures with how far the stream got.

use crate::services::metrics;
use crate::services::providers::{
    GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to open upstream stream: {0}")]
    Open(#[source] ProviderError),

    #[error("upstream stream failed after {deltas} deltas: {source}")]
    Interrupted {
        deltas: usize,
        #[source]
        source: ProviderError,
    },

    #[error("upstream stream stalled for {after:?} after {deltas} deltas")]
    Stalled { after: Duration, deltas: usize },
}

impl UpstreamError {
    /// Deltas received before the failure.
    pub fn deltas_received(&self) -> usize {
        match self {
            UpstreamError::Open(_) => 0,
            UpstreamError::Interrupted { deltas, .. } | UpstreamError::Stalled { deltas, .. } => {
                *deltas
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Open(source) | UpstreamError::Interrupted { source, .. } => {
                source.kind()
            }
            UpstreamError::Stalled { .. } => "stalled",
        }
    }
}

pub struct DeltaStream {
    inner: ProviderStream,
    idle_timeout: Duration,
    deltas: usize,
    fused: bool,
}

impl DeltaStream {
    pub fn new(inner: ProviderStream, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            deltas: 0,
            fused: false,
        }
    }

    /// Open one upstream generation call. Opening is bounded by the same
    /// inactivity timeout as every later pull.
    pub async fn open(
        provider: &dyn TextProvider,
        prompt: &str,
        params: &GenerationParams,
        idle_timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        match tokio::time::timeout(idle_timeout, provider.generate_stream(prompt, params)).await {
            Ok(Ok(inner)) => Ok(Self::new(inner, idle_timeout)),
            Ok(Err(e)) => Err(UpstreamError::Open(e)),
            Err(_) => Err(UpstreamError::Stalled {
                after: idle_timeout,
                deltas: 0,
            }),
        }
    }

    /// Number of non-empty deltas yielded so far.
    pub fn deltas(&self) -> usize {
        self.deltas
    }

    /// Next non-empty delta. `None` once the upstream is exhausted or after
    /// the first error.
    pub async fn next_delta(&mut self) -> Option<Result<String, UpstreamError>> {
        while !self.fused {
            let next = match tokio::time::timeout(self.idle_timeout, self.inner.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.fused = true;
                    return Some(Err(UpstreamError::Stalled {
                        after: self.idle_timeout,
                        deltas: self.deltas,
                    }));
                }
            };

            match next {
                Some(Ok(StreamChunk::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.deltas += 1;
                    return Some(Ok(text));
                }
                Some(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                })) => {
                    tracing::debug!(
                        input_tokens,
                        output_tokens,
                        finish_reason = finish_reason.as_str(),
                        "Upstream reported completion"
                    );
                    metrics::record_tokens(input_tokens, output_tokens);
                }
                Some(Err(source)) => {
                    self.fused = true;
                    return Some(Err(UpstreamError::Interrupted {
                        deltas: self.deltas,
                        source,
                    }));
                }
                None => self.fused = true,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::mock::{MockStep, MockTextProvider};

    const IDLE: Duration = Duration::from_millis(100);

    async fn open(steps: Vec<MockStep>) -> DeltaStream {
        let provider = MockTextProvider::scripted(steps);
        DeltaStream::open(&provider, "prompt", &GenerationParams::default(), IDLE)
            .await
            .unwrap()
    }

    async fn drain(stream: &mut DeltaStream) -> Vec<Result<String, UpstreamError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.next_delta().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn filters_empty_deltas_and_keeps_order() {
        let mut stream = open(vec![
            MockStep::text(""),
            MockStep::text("It "),
            MockStep::text(""),
            MockStep::text("could "),
            MockStep::text("be gastritis."),
        ])
        .await;

        let deltas: Vec<String> = drain(&mut stream)
            .await
            .into_iter()
            .map(|d| d.unwrap())
            .collect();
        assert_eq!(deltas, vec!["It ", "could ", "be gastritis."]);
        assert_eq!(stream.deltas(), 3);
    }

    #[tokio::test]
    async fn is_fused_after_an_error() {
        let mut stream = open(vec![
            MockStep::text("a"),
            MockStep::Fail("boom".into()),
        ])
        .await;

        let items = drain(&mut stream).await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(err @ UpstreamError::Interrupted { deltas: 1, .. }) => {
                assert_eq!(err.deltas_received(), 1);
                assert_eq!(err.kind(), "api_error");
            }
            other => panic!("unexpected item: {:?}", other),
        }
        assert!(stream.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn stalls_become_errors() {
        let mut stream = open(vec![
            MockStep::text("a"),
            MockStep::Pause(Duration::from_secs(5)),
            MockStep::text("b"),
        ])
        .await;

        assert_eq!(stream.next_delta().await.unwrap().unwrap(), "a");
        match stream.next_delta().await {
            Some(Err(UpstreamError::Stalled { deltas: 1, after })) => assert_eq!(after, IDLE),
            other => panic!("unexpected item: {:?}", other),
        }
        assert!(stream.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn open_failures_are_tagged() {
        let provider = MockTextProvider::failing_to_open("down");
        let result =
            DeltaStream::open(&provider, "prompt", &GenerationParams::default(), IDLE).await;
        match result {
            Err(err @ UpstreamError::Open(_)) => assert_eq!(err.deltas_received(), 0),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("open should fail"),
        }
    }
}
