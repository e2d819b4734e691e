//! Scripted provider for tests and local runs without credentials.

use super::{
    FinishReason, GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted upstream event.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Yield a text chunk (may be empty).
    Text(String),
    /// Yield an error and end the stream.
    Fail(String),
    /// Sleep before the next step.
    Pause(Duration),
}

impl MockStep {
    pub fn text(text: impl Into<String>) -> Self {
        MockStep::Text(text.into())
    }
}

#[derive(Debug, Clone)]
enum Script {
    /// Echo the prompt back word by word.
    Echo,
    Steps(Vec<MockStep>),
    FailToOpen(String),
}

/// Mock text provider.
#[derive(Debug)]
pub struct MockTextProvider {
    script: Script,
    calls: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
}

impl MockTextProvider {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Streams `Mock response for: <prompt>` one word at a time.
    pub fn echo() -> Self {
        Self::with_script(Script::Echo)
    }

    /// Plays `steps` in order for every call.
    pub fn scripted(steps: Vec<MockStep>) -> Self {
        Self::with_script(Script::Steps(steps))
    }

    /// Fails every call before a stream exists.
    pub fn failing_to_open(message: impl Into<String>) -> Self {
        Self::with_script(Script::FailToOpen(message.into()))
    }

    /// Number of `generate_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

/// Decrements the open stream count when the stream is dropped.
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Playback {
    steps: VecDeque<MockStep>,
    emitted: i32,
    finished: bool,
    _guard: OpenGuard,
}

#[async_trait]
impl TextProvider for MockTextProvider {
    async fn generate_stream(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let steps: VecDeque<MockStep> = match &self.script {
            Script::FailToOpen(message) => return Err(ProviderError::ApiError(message.clone())),
            Script::Steps(steps) => steps.iter().cloned().collect(),
            Script::Echo => format!("Mock response for: {}", prompt)
                .split_inclusive(' ')
                .map(MockStep::text)
                .collect(),
        };

        let playback = Playback {
            steps,
            emitted: 0,
            finished: false,
            _guard: OpenGuard::new(&self.open_streams),
        };

        let stream = futures::stream::unfold(playback, |mut playback| async move {
            if playback.finished {
                return None;
            }
            loop {
                match playback.steps.pop_front() {
                    Some(MockStep::Pause(duration)) => tokio::time::sleep(duration).await,
                    Some(MockStep::Text(text)) => {
                        playback.emitted += 1;
                        return Some((Ok(StreamChunk::Text(text)), playback));
                    }
                    Some(MockStep::Fail(message)) => {
                        playback.finished = true;
                        return Some((Err(ProviderError::ApiError(message)), playback));
                    }
                    None => {
                        playback.finished = true;
                        let complete = StreamChunk::Complete {
                            input_tokens: 0,
                            output_tokens: playback.emitted,
                            finish_reason: FinishReason::Complete,
                        };
                        return Some((Ok(complete), playback));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match &self.script {
            Script::FailToOpen(message) => Err(ProviderError::ApiError(message.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn echo_streams_the_prompt_word_by_word() {
        let provider = MockTextProvider::echo();
        let chunks: Vec<_> = provider
            .generate_stream("hi there", &GenerationParams::default())
            .await
            .unwrap()
            .collect()
            .await;

        let text: String = chunks
            .iter()
            .filter_map(|c| match c {
                Ok(StreamChunk::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Mock response for: hi there");
        assert!(matches!(
            chunks.last(),
            Some(Ok(StreamChunk::Complete { .. }))
        ));
    }

    #[tokio::test]
    async fn scripted_failure_ends_the_stream() {
        let provider = MockTextProvider::scripted(vec![
            MockStep::text("a"),
            MockStep::Fail("boom".into()),
            MockStep::text("never"),
        ]);
        let chunks: Vec<_> = provider
            .generate_stream("p", &GenerationParams::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(ProviderError::ApiError(_))));
    }

    #[tokio::test]
    async fn tracks_calls_and_open_streams() {
        let provider = MockTextProvider::scripted(vec![MockStep::text("a")]);
        let stream = provider
            .generate_stream("p", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.open_streams(), 1);

        drop(stream);
        assert_eq!(provider.open_streams(), 0);
    }

    #[tokio::test]
    async fn failing_to_open_returns_error() {
        let provider = MockTextProvider::failing_to_open("down");
        let result = provider
            .generate_stream("p", &GenerationParams::default())
            .await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 1);
    }
}
