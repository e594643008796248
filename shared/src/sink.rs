use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// Inbound half of the UI contract. Called from receive threads, so
/// implementations must be thread-safe and must not block.
pub trait ChatSink: Send + Sync {
    fn deliver(&self, sender: &str, text: &str);
    fn set_status(&self, text: &str, connected: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Message { sender: String, text: String },
    Status { text: String, connected: bool },
}

/// Queues every callback as a [`SinkEvent`] for whichever thread owns the
/// display.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    events: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (events, rx) = unbounded();
        (Self { events }, rx)
    }
}

impl ChatSink for ChannelSink {
    fn deliver(&self, sender: &str, text: &str) {
        let _ = self.events.send(SinkEvent::Message {
            sender: sender.to_owned(),
            text: text.to_owned(),
        });
    }

    fn set_status(&self, text: &str, connected: bool) {
        let _ = self.events.send(SinkEvent::Status {
            text: text.to_owned(),
            connected,
        });
    }
}

/// Waits up to `timeout` for the next delivered message, skipping status
/// updates.
pub fn next_message(
    events: &Receiver<SinkEvent>,
    timeout: Duration,
) -> Result<(String, String), RecvTimeoutError> {
    loop {
        match events.recv_timeout(timeout)? {
            SinkEvent::Message { sender, text } => return Ok((sender, text)),
            SinkEvent::Status { .. } => continue,
        }
    }
}
