//! Recent message context: a fixed-count sliding window and a time-bounded buffer.
//!
//! Both structures share the same `Arc<Message>` values and evict independently.
//! Messages are never referenced from outside once evicted: candidates only keep
//! their `MessageId`.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;

pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 20;
pub const DEFAULT_BUFFER_WINDOW: Duration = Duration::from_secs(10);

/// Separates messages in `WindowStore::full_window_text`.
pub const WINDOW_SEPARATOR: &str = "\n---\n";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("at least two messages are required, only {0} available")]
    InsufficientHistory(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId(value.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single chat message, immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    /// Cleaned message text.
    pub text: String,
    pub sender: String,
    pub channel_context: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    /// Opaque reference to wherever the message came from.
    pub source_handle: Option<String>,
}

impl Message {
    pub fn new(id: MessageId, text: &str) -> Self {
        Self {
            id,
            text: text.to_owned(),
            sender: String::new(),
            channel_context: String::new(),
            received_at: OffsetDateTime::now_utc(),
            source_handle: None,
        }
    }
}

/// The most recent messages, newest first, bounded by count.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    messages: VecDeque<Arc<Message>>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, message: Arc<Message>) {
        self.messages.push_front(message);
        self.messages.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Newest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Message>> {
        self.messages.iter()
    }
}

/// The most recent messages, newest first, bounded by count and by age.
/// Stale entries are only dropped when a new message is pushed.
#[derive(Debug)]
pub struct TimeBuffer {
    capacity: usize,
    max_age: Duration,
    entries: VecDeque<(Instant, Arc<Message>)>,
}

impl TimeBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, message: Arc<Message>, now: Instant) {
        while let Some((arrived, _)) = self.entries.back() {
            if now.saturating_duration_since(*arrived) > self.max_age {
                drop(self.entries.pop_back());
            } else {
                break;
            }
        }

        self.entries.push_front((now, message));
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Message>> {
        self.entries.iter().map(|(_, message)| message)
    }
}

/// The two most recent buffered messages, handed to sequential-pair reconstruction
/// every time an insertion leaves at least two messages in the time buffer.
#[derive(Debug, Clone)]
pub struct SequentialPair {
    pub newest: Arc<Message>,
    pub previous: Arc<Message>,
}

#[derive(Debug)]
pub struct WindowStore {
    window: SlidingWindow,
    buffer: TimeBuffer,
}

impl WindowStore {
    pub fn new(window_size: usize, buffer_size: usize, buffer_window: Duration) -> Self {
        Self {
            window: SlidingWindow::new(window_size),
            buffer: TimeBuffer::new(buffer_size, buffer_window),
        }
    }

    pub fn on_message(&mut self, message: Message) -> Option<SequentialPair> {
        self.on_message_at(message, Instant::now())
    }

    /// Insert a message into both the window and the buffer.
    pub fn on_message_at(&mut self, message: Message, now: Instant) -> Option<SequentialPair> {
        let message = Arc::new(message);

        self.window.push(message.clone());
        self.buffer.push(message, now);

        let mut buffered = self.buffer.iter();
        match (buffered.next(), buffered.next()) {
            (Some(newest), Some(previous)) => Some(SequentialPair {
                newest: newest.clone(),
                previous: previous.clone(),
            }),
            _ => None,
        }
    }

    /// The newest and second newest messages of the sliding window.
    pub fn recent_pair(&self) -> Result<(Arc<Message>, Arc<Message>), WindowError> {
        let mut messages = self.window.iter();
        match (messages.next(), messages.next()) {
            (Some(newest), Some(previous)) => Ok((newest.clone(), previous.clone())),
            _ => Err(WindowError::InsufficientHistory(self.window.len())),
        }
    }

    /// The text of every message in the window, oldest first, joined by `WINDOW_SEPARATOR`.
    pub fn full_window_text(&self) -> String {
        let texts: Vec<&str> = self
            .window
            .iter()
            .rev()
            .map(|message| message.text.as_str())
            .collect();

        texts.join(WINDOW_SEPARATOR)
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn buffer(&self) -> &TimeBuffer {
        &self.buffer
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new(
            DEFAULT_WINDOW_SIZE,
            DEFAULT_BUFFER_SIZE,
            DEFAULT_BUFFER_WINDOW,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> Message {
        Message::new(MessageId::from(format!("m{}", n)), &format!("text {}", n))
    }

    #[test]
    fn test_sliding_window_keeps_most_recent() {
        let mut store = WindowStore::default();

        for n in 0..15 {
            drop(store.on_message(message(n)));
        }

        let ids: Vec<String> = store
            .window()
            .iter()
            .map(|m| m.id.as_str().to_owned())
            .collect();
        let expected: Vec<String> = (5..15).rev().map(|n| format!("m{}", n)).collect();

        assert_eq!(store.window().len(), DEFAULT_WINDOW_SIZE);
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_recent_pair_requires_two_messages() {
        let mut store = WindowStore::default();
        assert_eq!(
            store.recent_pair().unwrap_err(),
            WindowError::InsufficientHistory(0)
        );

        drop(store.on_message(message(1)));
        assert_eq!(
            store.recent_pair().unwrap_err(),
            WindowError::InsufficientHistory(1)
        );

        drop(store.on_message(message(2)));
        let (newest, previous) = store.recent_pair().unwrap();
        assert_eq!(newest.id, MessageId::from("m2"));
        assert_eq!(previous.id, MessageId::from("m1"));
    }

    #[test]
    fn test_full_window_text_is_chronological() {
        let mut store = WindowStore::default();
        drop(store.on_message(message(1)));
        drop(store.on_message(message(2)));

        assert_eq!(store.full_window_text(), "text 1\n---\ntext 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_buffer_evicts_stale_messages_on_insert() {
        let mut store = WindowStore::default();

        assert!(store.on_message(message(1)).is_none());
        tokio::time::advance(Duration::from_secs(4)).await;
        let pair = store.on_message(message(2)).expect("two fresh messages");
        assert_eq!(pair.newest.id, MessageId::from("m2"));
        assert_eq!(pair.previous.id, MessageId::from("m1"));

        tokio::time::advance(Duration::from_secs(7)).await;
        // m1 is now 11 seconds old, m2 only 7.
        let pair = store.on_message(message(3)).expect("m2 is still fresh");
        assert_eq!(pair.previous.id, MessageId::from("m2"));
        assert_eq!(store.buffer().len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.on_message(message(4)).is_none());
        assert_eq!(store.buffer().len(), 1);
        assert_eq!(store.window().len(), 4);
    }

    #[test]
    fn test_time_buffer_is_bounded_by_count() {
        let mut buffer = TimeBuffer::new(3, Duration::from_secs(60));
        let now = Instant::now();

        for n in 0..5 {
            buffer.push(Arc::new(message(n)), now);
        }

        let ids: Vec<&str> = buffer.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3", "m2"]);
    }
}
