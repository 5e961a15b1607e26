//! Socket message framing.
//!
//! A frame is seven length-prefixed ASCII fields in fixed order:
//!
//! ```text
//! <len:pad><action> <len:1><store> <len:1><historical>
//! <len:pad><timestamp> <len:pad><topic> <len:pad><sender> <len:pad><payload>
//! ```
//!
//! Lengths are zero-padded decimal byte counts. Booleans are `t` or `f`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("frame truncated at byte {0}")]
    Truncated(usize),

    #[error("invalid length prefix at byte {0}")]
    BadLength(usize),

    #[error("field at byte {cursor} declares {len} bytes past the end of the frame")]
    LengthOutOfRange { cursor: usize, len: usize },

    #[error("field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("field of {len} bytes does not fit a {width}-digit prefix")]
    FieldTooLong { len: usize, width: usize },

    #[error("{0} trailing bytes after payload")]
    Trailing(usize),
}

/// Socket actions and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketAction {
    StartStream,
    StopStream,
    Subscribe,
    Unsubscribe,
    UnsubscribeTopic,
    LoadSubscribers,
    LoadMessages,
    HasMoreMessages,
    RoleCall,
    PingChannel,
    StreamInquiry,
    Text,
    Rtc,
    SetPosition,
    SetPage,
    SetScale,
    SetStroke,
    DrawLines,
    ChangeSetting,
    ShareFile,
}

const ACTIONS: [SocketAction; 20] = [
    SocketAction::StartStream,
    SocketAction::StopStream,
    SocketAction::Subscribe,
    SocketAction::Unsubscribe,
    SocketAction::UnsubscribeTopic,
    SocketAction::LoadSubscribers,
    SocketAction::LoadMessages,
    SocketAction::HasMoreMessages,
    SocketAction::RoleCall,
    SocketAction::PingChannel,
    SocketAction::StreamInquiry,
    SocketAction::Text,
    SocketAction::Rtc,
    SocketAction::SetPosition,
    SocketAction::SetPage,
    SocketAction::SetScale,
    SocketAction::SetStroke,
    SocketAction::DrawLines,
    SocketAction::ChangeSetting,
    SocketAction::ShareFile,
];

impl SocketAction {
    pub fn code(self) -> u8 {
        ACTIONS
            .iter()
            .position(|a| *a == self)
            .map(|i| i as u8)
            .unwrap_or_default()
    }

    pub fn from_code(code: u8) -> Option<Self> {
        ACTIONS.get(usize::from(code)).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMessage {
    pub action: SocketAction,
    pub store: bool,
    pub historical: bool,
    pub timestamp: String,
    pub topic: String,
    pub sender: String,
    pub payload: String,
}

impl SocketMessage {
    /// A bare message with every other field empty.
    pub fn new(action: SocketAction, topic: impl Into<String>) -> Self {
        Self {
            action,
            store: false,
            historical: false,
            timestamp: String::new(),
            topic: topic.into(),
            sender: String::new(),
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pad_to: usize,
    max_len: usize,
}

impl Codec {
    pub fn new(pad_to: usize, max_len: usize) -> Self {
        Self { pad_to, max_len }
    }

    pub fn encode(&self, message: &SocketMessage) -> Result<String, CodecError> {
        let mut out = String::new();
        self.push_field(&mut out, &message.action.code().to_string(), self.pad_to)?;
        self.push_field(&mut out, flag(message.store), 1)?;
        self.push_field(&mut out, flag(message.historical), 1)?;
        self.push_field(&mut out, &message.timestamp, self.pad_to)?;
        self.push_field(&mut out, &message.topic, self.pad_to)?;
        self.push_field(&mut out, &message.sender, self.pad_to)?;
        self.push_field(&mut out, &message.payload, self.pad_to)?;
        if out.len() > self.max_len {
            return Err(CodecError::TooLarge(out.len()));
        }
        Ok(out)
    }

    pub fn decode(&self, data: &[u8]) -> Result<SocketMessage, CodecError> {
        if data.len() > self.max_len {
            return Err(CodecError::TooLarge(data.len()));
        }

        let (cursor, action) = parse_field(self.pad_to, 0, data)?;
        let (cursor, store) = parse_field(1, cursor, data)?;
        let (cursor, historical) = parse_field(1, cursor, data)?;
        let (cursor, timestamp) = parse_field(self.pad_to, cursor, data)?;
        let (cursor, topic) = parse_field(self.pad_to, cursor, data)?;
        let (cursor, sender) = parse_field(self.pad_to, cursor, data)?;
        let (cursor, payload) = parse_field(self.pad_to, cursor, data)?;
        if cursor != data.len() {
            return Err(CodecError::Trailing(data.len() - cursor));
        }

        let action = action
            .parse::<u8>()
            .ok()
            .and_then(SocketAction::from_code)
            .ok_or_else(|| CodecError::UnknownAction(action.to_string()))?;

        Ok(SocketMessage {
            action,
            store: store == "t",
            historical: historical == "t",
            timestamp: timestamp.to_string(),
            topic: topic.to_string(),
            sender: sender.to_string(),
            payload: payload.to_string(),
        })
    }

    fn push_field(&self, out: &mut String, value: &str, width: usize) -> Result<(), CodecError> {
        let len = value.len();
        if len.to_string().len() > width {
            return Err(CodecError::FieldTooLong { len, width });
        }
        out.push_str(&format!("{len:0width$}"));
        out.push_str(value);
        Ok(())
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "t"
    } else {
        "f"
    }
}

/// Read one field starting at `cursor`; returns the next cursor and the value.
fn parse_field(width: usize, cursor: usize, data: &[u8]) -> Result<(usize, &str), CodecError> {
    let prefix = data
        .get(cursor..cursor + width)
        .ok_or(CodecError::Truncated(cursor))?;
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::BadLength(cursor));
    }
    let len: usize = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CodecError::BadLength(cursor))?;

    let start = cursor + width;
    let value = data
        .get(start..start + len)
        .ok_or(CodecError::LengthOutOfRange { cursor, len })?;
    let value = std::str::from_utf8(value).map_err(|_| CodecError::InvalidUtf8)?;
    Ok((start + len, value))
}
