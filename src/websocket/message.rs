use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};

/// Opaque relay payload. The frame kind is preserved; the contents are
/// never inspected. Clones share the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl RelayMessage {
    pub fn text(text: impl Into<Utf8Bytes>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Data frames become relay messages; control frames are not relayed.
    pub fn from_ws(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<RelayMessage> for Message {
    fn from(message: RelayMessage) -> Self {
        match message {
            RelayMessage::Text(text) => Message::Text(text),
            RelayMessage::Binary(data) => Message::Binary(data),
        }
    }
}
