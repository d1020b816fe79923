//! Reading chat messages from a line oriented stream.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use scanner_common::health::HealthHandle;
use scanner_common::window::{Message, MessageId};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::pipeline::Pipeline;

/// How many recent handles are remembered for duplicate detection.
pub const DEFAULT_DELIVERY_MEMORY: usize = 4096;

const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// One line of input. Lines that are not JSON objects are taken as plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IncomingMessage {
    pub text: String,
    /// Identifies the message at its origin. Redeliveries carry the same handle.
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl IncomingMessage {
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with('{') {
            if let Ok(incoming) = serde_json::from_str::<IncomingMessage>(line) {
                return Some(incoming);
            }
        }

        Some(IncomingMessage {
            text: line.to_owned(),
            ..Default::default()
        })
    }

    /// The handle when there is one, a fresh time ordered id otherwise.
    pub fn message_id(&self) -> MessageId {
        match &self.handle {
            Some(handle) if !handle.is_empty() => MessageId::from(handle.as_str()),
            _ => MessageId::from(Uuid::now_v7().to_string()),
        }
    }

    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            text: clean_text(&self.text),
            sender: self.sender.unwrap_or_default(),
            channel_context: self.channel.unwrap_or_default(),
            received_at: OffsetDateTime::now_utc(),
            source_handle: self.handle,
        }
    }
}

/// Drop zero width characters and collapse whitespace runs into single spaces.
pub fn clean_text(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();

    stripped.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Remembers the most recent message ids to drop redeliveries.
#[derive(Debug)]
pub struct DeliveryFilter {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl DeliveryFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false when the id was already delivered.
    pub fn first_delivery(&mut self, id: &MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }

        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                _ = self.seen.remove(&oldest);
            }
        }

        true
    }
}

impl Default for DeliveryFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_MEMORY)
    }
}

/// Feed every line of `reader` to the pipeline until the stream ends, then wait for
/// the triggers still in flight.
///
/// Liveness is reported for every line, and on every `idle_tick` while the stream is quiet.
pub async fn consume<R>(
    reader: R,
    pipeline: Arc<Pipeline>,
    liveness: HealthHandle,
    idle_tick: std::time::Duration,
) -> Result<(), WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut triggers = JoinSet::new();
    let mut ticker = tokio::time::interval(idle_tick);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                liveness.report_healthy().await;

                if let Some(trigger) = IncomingMessage::from_line(&line)
                    .and_then(|incoming| pipeline.ingest(incoming))
                {
                    drop(triggers.spawn(pipeline.clone().process(trigger)));
                }
            }
            _ = ticker.tick() => liveness.report_healthy().await,
            Some(joined) = triggers.join_next(), if !triggers.is_empty() => {
                if let Err(e) = joined {
                    error!("trigger processing failed: {}", e);
                }
            }
        }
    }

    info!("message source closed, waiting for {} triggers", triggers.len());
    while let Some(joined) = triggers.join_next().await {
        if let Err(e) = joined {
            error!("trigger processing failed: {}", e);
        }
    }

    Ok(())
}
