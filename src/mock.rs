//! Scripted serial link for testing without hardware.
//!
//! [`MockLink`] implements [`SerialLink`](crate::transport::SerialLink) with
//! a queue of scripted replies and a log of every command written, so tests
//! can assert on the exact wire traffic an operation produces. Clones share
//! state: hand one clone to the transport and keep the other as the test
//! handle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{StageError, StageResult};
use crate::transport::SerialLink;

enum ScriptedReply {
    Reply(String),
    Timeout,
    WireError(String),
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<ScriptedReply>,
    sent: Vec<String>,
    open: bool,
    open_count: usize,
    close_count: usize,
    fail_next_open: bool,
}

/// Shared-state mock serial link.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    /// Create a mock link with an empty reply script.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a reply for the next exchange. The terminator is appended
    /// automatically.
    pub fn enqueue_reply(&self, reply: &str) {
        self.lock()
            .replies
            .push_back(ScriptedReply::Reply(reply.to_string()));
    }

    /// Queue a read timeout for the next exchange.
    pub fn enqueue_timeout(&self) {
        self.lock().replies.push_back(ScriptedReply::Timeout);
    }

    /// Queue a wire failure for the next exchange.
    pub fn enqueue_wire_error(&self, message: &str) {
        self.lock()
            .replies
            .push_back(ScriptedReply::WireError(message.to_string()));
    }

    /// Make the next `open` call fail. One-shot.
    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    /// Commands written so far, terminators stripped.
    pub fn sent_commands(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Forget the commands written so far.
    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Number of scripted replies not yet consumed.
    pub fn remaining_replies(&self) -> usize {
        self.lock().replies.len()
    }

    /// Whether the link is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times the link has been opened.
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// How many times the link has been closed.
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }
}

impl SerialLink for MockLink {
    fn open(&mut self) -> StageResult<()> {
        let mut state = self.lock();
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(StageError::Connection(
                "mock open failure".to_string(),
            ));
        }
        if !state.open {
            state.open = true;
            state.open_count += 1;
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn write_all(&mut self, data: &[u8]) -> StageResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(StageError::Connection("mock link not open".to_string()));
        }
        let text = String::from_utf8_lossy(data);
        state.sent.push(text.trim_end_matches('\r').to_string());
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, _timeout: Duration) -> StageResult<String> {
        let mut state = self.lock();
        match state.replies.pop_front() {
            Some(ScriptedReply::Reply(reply)) => {
                Ok(format!("{reply}{}", char::from(terminator)))
            }
            Some(ScriptedReply::Timeout) => Err(StageError::Timeout),
            Some(ScriptedReply::WireError(message)) => Err(StageError::Connection(message)),
            // An unscripted exchange behaves like a silent device.
            None => Err(StageError::Timeout),
        }
    }
}
