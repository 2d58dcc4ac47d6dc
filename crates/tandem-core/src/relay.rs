//! Streaming relay between the generation thread and a single consumer
//!
//! The producer side is pushed from the blocking generation loop and never
//! waits. The consumer is a [`Stream`] that decodes and normalises each unit
//! and ends with exactly one [`RelayEvent::Closed`].

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::generation::{FinishReason, PartialOutput, StepSink};
use crate::tokenizer::Tokenizer;
use crate::CoreError;

/// Trailing fragments treated as the start of a heading still being written
pub const HEADING_FRAGMENTS: [&str; 3] = ["\n\n###", "\n\n##", "\n\n#"];

/// Why a relay stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The loop reached a stop condition
    Finished(FinishReason),
    /// The request failed or the producer went away before finishing
    Aborted { code: String, message: String },
}

impl CloseReason {
    pub fn aborted(err: &CoreError) -> Self {
        CloseReason::Aborted {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CloseReason::Finished(_))
    }
}

enum Message {
    Partial(PartialOutput),
    Close(CloseReason),
}

/// What the consumer observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Normalised text of everything generated so far
    Partial(String),
    /// Terminal sentinel; nothing follows it
    Closed(CloseReason),
}

/// Create a connected producer/consumer pair
pub fn relay(tokenizer: Arc<dyn Tokenizer>, stop_marker: impl Into<String>) -> (RelayProducer, RelayConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RelayProducer { tx, closed: false },
        RelayConsumer {
            rx,
            tokenizer,
            stop_marker: stop_marker.into(),
            finished: false,
        },
    )
}

/// Generation-thread side of the relay
pub struct RelayProducer {
    tx: mpsc::UnboundedSender<Message>,
    closed: bool,
}

impl RelayProducer {
    /// Hand off one unit. Never blocks; a consumer that went away is ignored.
    pub fn push(&mut self, unit: PartialOutput) {
        if self.tx.send(Message::Partial(unit)).is_err() {
            trace!("relay consumer gone; discarding unit");
        }
    }

    /// Send the terminal sentinel
    pub fn close(mut self, reason: CloseReason) {
        self.send_close(reason);
    }

    fn send_close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Message::Close(reason));
    }
}

impl StepSink for RelayProducer {
    fn push(&mut self, unit: PartialOutput) {
        RelayProducer::push(self, unit);
    }
}

impl Drop for RelayProducer {
    fn drop(&mut self) {
        if !self.closed {
            warn!("relay producer dropped without closing");
            self.send_close(CloseReason::Aborted {
                code: "RELAY_DROPPED".to_string(),
                message: "producer dropped before the loop finished".to_string(),
            });
        }
    }
}

/// Consumer side of the relay
pub struct RelayConsumer {
    rx: mpsc::UnboundedReceiver<Message>,
    tokenizer: Arc<dyn Tokenizer>,
    stop_marker: String,
    finished: bool,
}

impl RelayConsumer {
    /// The partial texts only, ending when the sentinel arrives
    pub fn consume(self) -> impl Stream<Item = String> {
        use futures::StreamExt;
        self.filter_map(|event| async move {
            match event {
                RelayEvent::Partial(text) => Some(text),
                RelayEvent::Closed(_) => None,
            }
        })
    }

    fn finish(&mut self, reason: CloseReason) -> Poll<Option<RelayEvent>> {
        self.finished = true;
        self.rx.close();
        Poll::Ready(Some(RelayEvent::Closed(reason)))
    }
}

impl Stream for RelayConsumer {
    type Item = RelayEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Message::Partial(unit))) => match this.tokenizer.decode(&unit.tokens) {
                Ok(text) => Poll::Ready(Some(RelayEvent::Partial(normalize_partial(
                    &text,
                    &this.stop_marker,
                )))),
                Err(e) => this.finish(CloseReason::aborted(&e)),
            },
            Poll::Ready(Some(Message::Close(reason))) => this.finish(reason),
            Poll::Ready(None) => this.finish(CloseReason::Aborted {
                code: "RELAY_DISCONNECTED".to_string(),
                message: "producer vanished without a sentinel".to_string(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Prepare decoded partial text for display.
///
/// Keeps only the text before the stop marker, then drops a trailing
/// paragraph that is a heading fragment or the start of the stop marker,
/// back to the previous paragraph break.
pub fn normalize_partial(text: &str, stop_marker: &str) -> String {
    let kept = if stop_marker.is_empty() {
        text
    } else {
        text.split(stop_marker).next().unwrap_or(text)
    }
    .trim_end();

    if let Some((head, tail)) = kept.rsplit_once("\n\n") {
        let marker_started = !stop_marker.is_empty() && stop_marker.starts_with(tail);
        if marker_started || HEADING_FRAGMENTS.iter().any(|fragment| kept.ends_with(fragment)) {
            return head.trim().to_string();
        }
    }
    kept.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CharTokenizer;
    use futures::StreamExt;

    fn unit(step: usize, text: &str) -> PartialOutput {
        PartialOutput {
            step,
            tokens: text.chars().map(u32::from).collect(),
        }
    }

    #[test]
    fn test_normalize_strips_stop_marker() {
        assert_eq!(normalize_partial("Sure.\n\n### User\nmore", "### User"), "Sure.");
        assert_eq!(normalize_partial("  plain  ", "### User"), "plain");
        assert_eq!(normalize_partial("a ### User b ### User", "### User"), "a");
        assert_eq!(normalize_partial("no marker", ""), "no marker");
    }

    #[test]
    fn test_normalize_drops_heading_fragments() {
        assert_eq!(normalize_partial("Intro.\n\n##", "### User"), "Intro.");
        assert_eq!(normalize_partial("Intro.\n\nBody.\n\n###", "### User"), "Intro.\n\nBody.");
        assert_eq!(normalize_partial("Intro.\n\n#", "### User"), "Intro.");
        assert_eq!(normalize_partial("Intro.\n\n## ", "### User"), "Intro.");
        // a complete heading is kept
        assert_eq!(normalize_partial("Intro.\n\n## Facts", "### User"), "Intro.\n\n## Facts");
    }

    #[test]
    fn test_normalize_hides_a_stop_marker_being_written() {
        assert_eq!(normalize_partial("Sure.\n\n### Use", "### User"), "Sure.");
        assert_eq!(normalize_partial("Sure.\n\n### U", "### User"), "Sure.");
        // the reply never shrinks once the marker completes
        assert_eq!(normalize_partial("Sure.\n\n### User", "### User"), "Sure.");
        // only a prefix of the marker is hidden
        assert_eq!(normalize_partial("Sure.\n\n### Usage", "### User"), "Sure.\n\n### Usage");
        assert_eq!(normalize_partial("Sure.\n\nUse it.", "### User"), "Sure.\n\nUse it.");
    }

    #[tokio::test]
    async fn test_sentinel_ends_the_stream_once() {
        let (mut producer, consumer) = relay(Arc::new(CharTokenizer), "### User");
        producer.push(unit(1, "He"));
        producer.push(unit(2, "Hello"));
        producer.close(CloseReason::Finished(FinishReason::MaxLength));

        let events: Vec<RelayEvent> = consumer.collect().await;
        assert_eq!(
            events,
            vec![
                RelayEvent::Partial("He".to_string()),
                RelayEvent::Partial("Hello".to_string()),
                RelayEvent::Closed(CloseReason::Finished(FinishReason::MaxLength)),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_producer_aborts() {
        let (mut producer, consumer) = relay(Arc::new(CharTokenizer), "### User");
        producer.push(unit(1, "Hi"));
        drop(producer);

        let events: Vec<RelayEvent> = consumer.collect().await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            RelayEvent::Closed(CloseReason::Aborted { code, .. }) => assert_eq!(code, "RELAY_DROPPED"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_from_blocking_thread() {
        let (mut producer, consumer) = relay(Arc::new(CharTokenizer), "### User");
        let handle = tokio::task::spawn_blocking(move || {
            for step in 1..=3 {
                producer.push(unit(step, &"x".repeat(step)));
            }
            producer.close(CloseReason::Finished(FinishReason::EndOfSequence));
        });

        let texts: Vec<String> = consumer.consume().collect().await;
        handle.await.unwrap();
        assert_eq!(texts, vec!["x", "xx", "xxx"]);
    }

    #[test]
    fn test_push_after_consumer_gone_is_harmless() {
        let (mut producer, consumer) = relay(Arc::new(CharTokenizer), "### User");
        drop(consumer);
        producer.push(unit(1, "ignored"));
        producer.close(CloseReason::Finished(FinishReason::MaxLength));
    }
}
