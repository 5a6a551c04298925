//! Wire types for the browser-facing WebSocket gateway.
//!
//! Every frame is a JSON object with a `type` discriminator. Raw host bytes
//! travel inside JSON strings through a latin-1 mapping: byte 0xNN becomes
//! the char U+00NN and back, so all 256 byte values round-trip with no
//! escaping or normalization. The browser side applies the same mapping
//! before feeding the terminal.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client -> bridge events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Open a host session with the given application credentials.
    StartSession {
        username: String,
        #[serde(default)]
        password: String,
    },
    /// Keystrokes for the host, latin-1 text.
    Input { data: String },
    /// Tear down the session.
    Disconnect,
    /// Accepted for xterm.js compatibility; the host is fixed at 80x24.
    Resize {
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
}

/// Bridge -> client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Transport-level hello, sent once per WebSocket connection.
    Connected { session_id: String },
    /// Outcome of a `start_session` request.
    SessionStarted { status: SessionStatus },
    /// Raw host output, latin-1 text, verbatim.
    Output { data: String },
    /// A failure the client should display; the session may or may not
    /// survive it.
    Error { message: String },
    /// The session is over.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ok,
    Error,
}

impl ServerEvent {
    pub fn output(data: &[u8]) -> Self {
        Self::Output {
            data: latin1_decode(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Map raw bytes onto a string one char per byte (latin-1).
pub fn latin1_decode(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

/// Map a string back to bytes, one byte per char.
///
/// Chars above U+00FF cannot exist in host output but can arrive in client
/// input; they become `?` rather than killing the session.
pub fn latin1_encode(text: &str) -> Bytes {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect::<Vec<u8>>()
        .into()
}
