// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::protocol::Command;
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard},
};

/// Commands waiting to be written to a fork's standard input.
///
/// Any thread may push commands. A single feeder thread takes them off with
/// [`next_command`](Self::next_command), which blocks until a command arrives or the queue is
/// closed.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    state: Mutex<CommandQueueState>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct CommandQueueState {
    commands: VecDeque<Command>,
    closed: bool,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a command. Returns false if the queue is already closed.
    pub(crate) fn push(&self, command: Command) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.commands.push_back(command);
        self.condvar.notify_one();
        true
    }

    /// Waits for the next command.
    ///
    /// Commands queued before [`close`](Self::close) are still returned. Returns `None` once the
    /// queue is closed and drained.
    pub(crate) fn next_command(&self) -> Option<Command> {
        let mut state = self.lock();
        loop {
            if let Some(command) = state.commands.pop_front() {
                return Some(command);
            }
            if state.closed {
                return None;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, CommandQueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Test classes shared between reusable forks. Each class is handed out exactly once.
#[derive(Debug, Default)]
pub(crate) struct TestQueue {
    classes: Mutex<VecDeque<String>>,
}

impl TestQueue {
    pub(crate) fn new(classes: impl IntoIterator<Item = String>) -> Self {
        Self {
            classes: Mutex::new(classes.into_iter().collect()),
        }
    }

    pub(crate) fn next_class(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Removes every remaining class, returning how many there were.
    pub(crate) fn clear(&self) -> usize {
        let mut classes = self.lock();
        let len = classes.len();
        classes.clear();
        len
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{sync::Arc, thread};

    #[test]
    fn commands_drain_after_close() {
        let queue = CommandQueue::new();
        assert!(queue.push(Command::RunClass("a.One".to_owned())));
        assert!(queue.push(Command::TestSetFinished));
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.push(Command::Noop));

        assert_eq!(
            queue.next_command(),
            Some(Command::RunClass("a.One".to_owned()))
        );
        assert_eq!(queue.next_command(), Some(Command::TestSetFinished));
        assert_eq!(queue.next_command(), None);
    }

    #[test]
    fn next_command_waits_for_push() {
        let queue = Arc::new(CommandQueue::new());
        let reader = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut received = Vec::new();
                while let Some(command) = queue.next_command() {
                    received.push(command);
                }
                received
            })
        };

        queue.push(Command::ByeAck);
        queue.close();
        let received = reader.join().expect("reader thread panicked");
        assert_eq!(received, vec![Command::ByeAck]);
    }

    #[test]
    fn test_queue_hands_out_each_class_once() {
        let queue = TestQueue::new(["a.One", "a.Two", "a.Three"].map(String::from));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.next_class().as_deref(), Some("a.One"));
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.next_class(), None);
    }
}
