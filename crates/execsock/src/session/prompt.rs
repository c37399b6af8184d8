//! Prompt detection and output gating
//!
//! Program stdout is cut into lines. Each line is offered to a
//! [`PromptDetector`]; a prompt is sent to the client marked as such and
//! further stdout is held back until the client answers with an `input`.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::PromptDetection;
use crate::session::protocol::ServerMessage;

/// Strategy deciding whether a line of output is waiting for input
pub trait PromptDetector: Send + Sync + fmt::Debug {
    /// `line` may still carry its trailing newline
    fn is_prompt(&self, line: &str) -> bool;
}

/// Treats a line as a prompt when it ends in `:`, `?` or whitespace
///
/// Any ordinary sentence ending in a question mark is reported as a prompt
/// too. That is a limitation of the heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingMarker;

impl PromptDetector for TrailingMarker {
    fn is_prompt(&self, line: &str) -> bool {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return false;
        }
        line.ends_with([' ', '\t']) || line.trim_end().ends_with([':', '?'])
    }
}

/// Never reports a prompt
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompts;

impl PromptDetector for NoPrompts {
    fn is_prompt(&self, _line: &str) -> bool {
        false
    }
}

/// Build the detector for a configured strategy
pub fn detector_for(mode: PromptDetection) -> Arc<dyn PromptDetector> {
    match mode {
        PromptDetection::Heuristic => Arc::new(TrailingMarker),
        PromptDetection::Disabled => Arc::new(NoPrompts),
    }
}

/// Turns raw stdout chunks into client messages
///
/// Complete lines and trailing fragments are forwarded as soon as they
/// arrive. Blank lines are dropped. While a prompt is outstanding, output is
/// held and any further prompt is demoted to plain output.
#[derive(Debug)]
pub struct OutputGate {
    detector: Arc<dyn PromptDetector>,
    /// Whitespace seen at the start of a line that has not ended yet
    leading: String,
    /// The last forwarded piece did not end with a newline
    mid_line: bool,
    awaiting_input: bool,
    held: String,
}

impl OutputGate {
    pub fn new(detector: Arc<dyn PromptDetector>) -> Self {
        Self {
            detector,
            leading: String::new(),
            mid_line: false,
            awaiting_input: false,
            held: String::new(),
        }
    }

    /// Check whether a prompt is waiting for input
    pub fn is_awaiting_input(&self) -> bool {
        self.awaiting_input
    }

    /// Process a chunk of stdout
    pub fn accept(&mut self, chunk: &str) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        let mut rest = chunk;
        while !rest.is_empty() {
            let (piece, complete) = match rest.find('\n') {
                Some(end) => (&rest[..=end], true),
                None => (rest, false),
            };
            rest = &rest[piece.len()..];
            self.push_piece(piece, complete, &mut out);
        }
        out
    }

    /// Input was supplied: resume forwarding
    pub fn release(&mut self) -> Option<ServerMessage> {
        self.awaiting_input = false;
        self.take_held()
    }

    /// Forward everything held and reset line state
    ///
    /// Used before status notices and at the end of an execution.
    pub fn flush(&mut self) -> Option<ServerMessage> {
        self.awaiting_input = false;
        self.mid_line = false;
        self.leading.clear();
        self.take_held()
    }

    fn push_piece(&mut self, piece: &str, complete: bool, out: &mut Vec<ServerMessage>) {
        let mut text = std::mem::take(&mut self.leading);
        text.push_str(piece);

        if !self.mid_line && text.trim().is_empty() {
            if !complete {
                // Indentation: wait for the rest of the line
                self.leading = text;
            }
            return;
        }
        self.mid_line = !complete;

        if self.awaiting_input {
            if self.detector.is_prompt(&text) {
                debug!("suppressing prompt while another is pending");
            }
            self.held.push_str(&text);
            return;
        }

        if self.detector.is_prompt(&text) {
            self.awaiting_input = true;
            out.push(ServerMessage::prompt(text));
        } else {
            out.push(ServerMessage::output(text));
        }
    }

    fn take_held(&mut self) -> Option<ServerMessage> {
        if self.held.is_empty() {
            return None;
        }
        Some(ServerMessage::output(std::mem::take(&mut self.held)))
    }
}
