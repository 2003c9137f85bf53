//! Change feed events and `text/event-stream` decoding.

use crate::cursor::{EventId, SyncCursor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::path::validate_relative_path;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Type of change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    /// A file was created or modified.
    FileChanged,
    /// A file was deleted.
    FileDeleted,
    /// The server detected a conflicting commit.
    SyncConflict,
    /// Keep-alive.
    Heartbeat,
}

impl FeedEventKind {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedEventKind::FileChanged => "file_changed",
            FeedEventKind::FileDeleted => "file_deleted",
            FeedEventKind::SyncConflict => "sync_conflict",
            FeedEventKind::Heartbeat => "heartbeat",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file_changed" => Some(FeedEventKind::FileChanged),
            "file_deleted" => Some(FeedEventKind::FileDeleted),
            "sync_conflict" => Some(FeedEventKind::SyncConflict),
            "heartbeat" => Some(FeedEventKind::Heartbeat),
            _ => None,
        }
    }

    /// Returns true if the event says something changed on the server.
    pub fn signals_change(&self) -> bool {
        !matches!(self, FeedEventKind::Heartbeat)
    }
}

/// A validated change-feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    /// Event type.
    pub kind: FeedEventKind,
    /// Stream id used for resumption.
    pub id: Option<EventId>,
    /// Manifest cursor at which the change is visible.
    pub cursor: Option<SyncCursor>,
    /// Thread the change belongs to.
    pub thread_id: Option<String>,
    /// Affected path.
    pub path: Option<String>,
    /// New revision (for `file_changed`).
    pub revision_id: Option<String>,
    /// Server time of the change.
    pub updated_at: Option<DateTime<Utc>>,
}

/// A decoded message from the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// A regular event.
    Event(FeedEvent),
    /// The server cannot resume from the requested id; the client must fall
    /// back to a full reconciliation.
    Reset,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventData {
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    revision_id: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl FeedMessage {
    /// Validates a raw frame into a message.
    ///
    /// The event name comes from the `event:` field, falling back to a `type`
    /// member of the JSON data. File events must name a valid path.
    pub fn from_frame(frame: &SseFrame) -> ProtocolResult<Self> {
        let data: EventData = if frame.data.trim().is_empty() {
            EventData::default()
        } else {
            serde_json::from_str(&frame.data)
                .map_err(|e| ProtocolError::malformed("feed event", e.to_string()))?
        };

        let name = frame
            .event
            .clone()
            .or_else(|| data.r#type.clone())
            .unwrap_or_else(|| "message".to_string());

        if name == "reset" {
            return Ok(FeedMessage::Reset);
        }

        let kind = FeedEventKind::from_name(&name).ok_or(ProtocolError::UnknownEvent(name))?;

        let path = match data.path {
            Some(path) => Some(validate_relative_path(&path)?.to_string()),
            None => None,
        };
        if matches!(kind, FeedEventKind::FileChanged | FeedEventKind::FileDeleted)
            && path.is_none()
        {
            return Err(ProtocolError::invalid_field("path", "required for file events"));
        }

        let cursor = match data.cursor {
            Some(token) if !token.trim().is_empty() => Some(SyncCursor::parse(token)?),
            _ => None,
        };
        let id = match &frame.id {
            Some(token) if !token.trim().is_empty() => Some(EventId::parse(token.clone())?),
            _ => None,
        };

        Ok(FeedMessage::Event(FeedEvent {
            kind,
            id,
            cursor,
            thread_id: data.thread_id,
            path,
            revision_id: data.revision_id,
            updated_at: data.updated_at,
        }))
    }
}

/// One dispatched `text/event-stream` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `id:` field.
    pub id: Option<String>,
    /// `event:` field.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// `retry:` reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may be pushed in arbitrary pieces; a line split across two chunks
/// (or a multi-byte character split across two chunks) is held until the
/// line terminator arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    frame: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes bytes and returns every frame completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.frame.id = Some(value.to_string()),
            "event" => self.frame.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.frame.data.push('\n');
                }
                self.frame.data.push_str(value);
                self.has_data = true;
            }
            "retry" => self.frame.retry = value.trim().parse().ok(),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.frame);
        let has_data = std::mem::replace(&mut self.has_data, false);
        if has_data || frame.event.is_some() {
            Some(frame)
        } else {
            None
        }
    }
}
