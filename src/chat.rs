//! Chat notification sink
//!
//! Federation handlers announce social events ("X just followed") to the
//! chat subsystem. Chat broadcasting itself lives outside this crate, so
//! the sink is a trait; deployments plug in their own transport.

use std::sync::Mutex;

/// Destination for system messages produced by federation handlers.
///
/// Implementations must be cheap and must never fail visibly: a dropped
/// notification is acceptable, a failed inbox activity is not.
pub trait ChatSink: Send + Sync {
    /// Deliver a system message to connected chat clients.
    fn send_system_message(&self, message: &str, is_private: bool);
}

/// Sink that forwards system messages to the tracing log.
///
/// Used when no chat subsystem is wired up.
pub struct LoggingChatSink;

impl ChatSink for LoggingChatSink {
    fn send_system_message(&self, message: &str, is_private: bool) {
        tracing::info!(private = is_private, "chat system message: {}", message);
    }
}

/// Sink that records every message, for assertions in tests.
#[derive(Default)]
pub struct RecordingChatSink {
    messages: Mutex<Vec<(String, bool)>>,
}

impl RecordingChatSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages received so far.
    pub fn messages(&self) -> Vec<(String, bool)> {
        self.messages.lock().expect("sink lock poisoned").clone()
    }
}

impl ChatSink for RecordingChatSink {
    fn send_system_message(&self, message: &str, is_private: bool) {
        self.messages
            .lock()
            .expect("sink lock poisoned")
            .push((message.to_string(), is_private));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_messages_in_order() {
        let sink = RecordingChatSink::new();
        sink.send_system_message("first", false);
        sink.send_system_message("second", true);

        assert_eq!(
            sink.messages(),
            vec![
                ("first".to_string(), false),
                ("second".to_string(), true),
            ]
        );
    }
}
