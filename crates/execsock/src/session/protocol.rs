//! Wire messages
//!
//! Every frame is a JSON object with a `type` discriminator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A frame that could not be decoded
#[derive(Debug, Error)]
#[error("Invalid message format: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

/// Message sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Compile and run the given source
    Execute {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// One line for the program's stdin (without the newline)
    Input { value: String },

    /// Terminate the running program
    Stop,
}

impl ClientMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> String {
        // Only strings, serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"stop"}"#.to_owned())
    }
}

/// Message sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Program output or status text
    Output {
        data: String,
        /// Set when the text is a line the program is waiting on input for
        #[serde(default, skip_serializing_if = "is_false")]
        prompt: bool,
    },

    /// Error text (compile diagnostics, stderr, failures)
    Error { data: String },

    /// The execution attempt is over
    Done { success: bool },
}

impl ServerMessage {
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output {
            data: data.into(),
            prompt: false,
        }
    }

    pub fn prompt(data: impl Into<String>) -> Self {
        ServerMessage::Output {
            data: data.into(),
            prompt: true,
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        ServerMessage::Error { data: data.into() }
    }

    pub fn done(success: bool) -> Self {
        ServerMessage::Done { success }
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> String {
        // Only strings and booleans, serialization cannot fail
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"done","success":false}"#.to_owned())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
