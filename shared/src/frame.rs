//! Chat frames and the line framing used on the TCP wire.
//!
//! A frame travels as `"<sender>: <text>\n"`. There is no escaping, so a
//! `": "` inside the sender or a newline inside the text corrupts framing.

use std::mem;

use arrayvec::ArrayString;
use log::debug;

use crate::{TransportError, MAX_SENDER_LEN, MAX_TEXT_LEN};

pub type SenderName = ArrayString<MAX_SENDER_LEN>;
pub type MessageText = ArrayString<MAX_TEXT_LEN>;

const SEPARATOR: &str = ": ";

/// One unit of chat content. Both fields are bounded and stored inline so a
/// frame can live in a shared memory slot as-is.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ChatFrame {
    sender: SenderName,
    text: MessageText,
}

impl ChatFrame {
    /// Builds a frame, cutting `sender` and `text` down to their bounds on
    /// a character boundary.
    pub fn new(sender: &str, text: &str) -> Self {
        Self {
            sender: truncated(sender),
            text: truncated(text),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn to_line(&self) -> String {
        format!("{}{SEPARATOR}{}\n", self.sender, self.text)
    }

    /// Splits a received line (delimiter already stripped) at the first
    /// `": "`.
    pub fn parse_line(line: &str) -> Result<Self, TransportError> {
        match line.split_once(SEPARATOR) {
            Some((sender, text)) => Ok(Self::new(sender, text)),
            None => Err(TransportError::MalformedFrame(line.to_owned())),
        }
    }
}

pub(crate) fn truncated<const CAP: usize>(s: &str) -> ArrayString<CAP> {
    let mut end = s.len().min(CAP);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    ArrayString::from(&s[..end]).unwrap_or_default()
}

/// Reassembles newline-terminated lines from arbitrarily split reads.
#[derive(Debug)]
pub struct LineAssembler {
    pending: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl LineAssembler {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Appends `chunk` and returns every line it completed, without the
    /// trailing `\n` (or `\r\n`). A partial line is kept for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if mem::take(&mut self.discarding) {
                self.pending.clear();
                continue;
            }

            self.pending.extend_from_slice(head);
            let mut line = mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_line {
                debug!("dropping {} byte line", line.len());
                continue;
            }
            lines.push(line);
        }

        if !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > self.max_line {
                debug!("line exceeds {} bytes, discarding", self.max_line);
                self.pending.clear();
                self.discarding = true;
            }
        }

        lines
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
