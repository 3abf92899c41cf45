//! Versioned envelope for journal entries and bus messages.
//!
//! Everything the engine writes to NATS is wrapped in an [`Envelope`]. The
//! version lets old journals be read after the payload format changes; the
//! message id doubles as the JetStream deduplication key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned, identified payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    /// Stable identifier; writing the same id twice stores the payload once.
    pub message_id: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload with the current version.
    #[must_use]
    pub fn new(message_id: impl Into<String>, payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            message_id: message_id.into(),
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Errors from reading an envelope.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The bytes are not an envelope, or the payload has the wrong shape.
    Malformed(serde_json::Error),
    /// Written by a newer engine.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed envelope: {e}"),
            Self::UnsupportedVersion { version } => write!(
                f,
                "envelope version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// An envelope whose payload has not been decoded yet.
///
/// Checking the version before touching the payload keeps a newer writer
/// from being misread as a malformed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub version: u32,
    pub message_id: String,
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// Parses the envelope frame from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Malformed` if the bytes are not an envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported versions and undecodable payloads.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Envelope<T>, EnvelopeError> {
        if self.version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                version: self.version,
            });
        }
        let payload = serde_json::from_value(self.payload).map_err(EnvelopeError::Malformed)?;
        Ok(Envelope {
            version: self.version,
            message_id: self.message_id,
            payload,
        })
    }
}

/// Decodes an envelope from JSON bytes in one step.
///
/// # Errors
///
/// Returns an error for malformed bytes and unsupported versions.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, EnvelopeError> {
    RawEnvelope::from_json_bytes(bytes)?.decode()
}
