//! Protocol message definitions
//!
//! Inbound messages are JSON envelopes of the form
//! `{ "type": "data" | "resize", "data": <payload> }`. Outbound traffic is raw
//! terminal text, one WebSocket text frame per decoded unit.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Envelope type for terminal input
pub const TYPE_DATA: &str = "data";

/// Envelope type for viewport changes
pub const TYPE_RESIZE: &str = "resize";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Text frame is not a JSON envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope carries a type this bridge does not speak
    #[error("Protocol violation: unknown message type {0:?}")]
    UnknownType(String),

    /// Known type with a payload of the wrong shape
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Whether the error ends the connection rather than just the message
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Malformed(_))
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Wire envelope wrapping every client message
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Envelope {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload
    #[serde(default)]
    pub data: Value,
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from the remote terminal client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Text to inject into the terminal input
    Data(String),

    /// New viewport size
    Resize {
        /// Terminal width in columns
        cols: u16,
        /// Terminal height in rows
        rows: u16,
    },
}

impl ClientMessage {
    /// Parse a client message from a JSON text frame
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Envelope = serde_json::from_str(json)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    /// Decode the payload of an already parsed envelope
    pub fn from_envelope(envelope: Envelope) -> ProtocolResult<Self> {
        match envelope.kind.as_str() {
            TYPE_DATA => serde_json::from_value::<String>(envelope.data)
                .map(ClientMessage::Data)
                .map_err(|e| ProtocolError::Malformed(format!("data payload: {}", e))),
            TYPE_RESIZE => parse_resize(envelope.data),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Client-side encoding, used to drive the bridge in tests
#[cfg(test)]
impl ClientMessage {
    /// Wrap the message in its wire envelope
    pub fn to_envelope(&self) -> Envelope {
        match self {
            ClientMessage::Data(text) => Envelope {
                kind: TYPE_DATA.to_string(),
                data: Value::from(text.as_str()),
            },
            ClientMessage::Resize { cols, rows } => Envelope {
                kind: TYPE_RESIZE.to_string(),
                data: Value::from(vec![*cols, *rows]),
            },
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(&self.to_envelope())
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    /// Create a Data message
    pub fn data(text: impl Into<String>) -> Self {
        ClientMessage::Data(text.into())
    }

    /// Create a Resize message
    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize { cols, rows }
    }
}

/// Resize payloads are `[cols, rows]`; fractional values are truncated
fn parse_resize(data: Value) -> ProtocolResult<ClientMessage> {
    let dims: Vec<f64> = serde_json::from_value(data)
        .map_err(|e| ProtocolError::Malformed(format!("resize payload: {}", e)))?;

    let &[cols, rows] = dims.as_slice() else {
        return Err(ProtocolError::Malformed(format!(
            "resize payload must be [cols, rows], got {} values",
            dims.len()
        )));
    };

    Ok(ClientMessage::Resize {
        cols: dimension(cols)?,
        rows: dimension(rows)?,
    })
}

fn dimension(value: f64) -> ProtocolResult<u16> {
    if !value.is_finite() || value < 0.0 || value > f64::from(u16::MAX) {
        return Err(ProtocolError::Malformed(format!(
            "resize dimension {} out of range",
            value
        )));
    }
    Ok(value as u16)
}
