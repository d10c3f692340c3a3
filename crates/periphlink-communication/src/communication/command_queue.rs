//! Command/response correlation
//!
//! Command/response devices answer each command with zero or more partial
//! lines followed by a terminating line. Responses arrive strictly in the
//! order commands were sent, so the oldest pending command owns the next
//! completed block.
//!
//! # Features
//! - FIFO of commands awaiting their response block
//! - Accumulation of partial lines into the block in progress
//! - Orphan detection when a block ends with nothing pending
//! - Cancellation of every waiter when the connection closes

use periphlink_core::{CommandError, ProtocolError, ResponseBlock};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Role of one received line in the command/response conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Status chatter to drop
    Ignore,
    /// Part of the response in progress
    Partial,
    /// Terminates the response in progress
    End,
    /// Matches no known shape
    Unknown,
}

/// What a waiting caller eventually receives
pub type CommandResult = Result<ResponseBlock, CommandError>;

/// Sending half handed to the session that will resolve a command
pub type Responder = oneshot::Sender<CommandResult>;

/// A command written to the device, waiting for its response block
#[derive(Debug)]
pub struct PendingCommand {
    /// Command text without line terminator
    pub command: String,
    responder: Responder,
}

impl PendingCommand {
    /// Pair a command with the channel its caller waits on
    pub fn new(command: impl Into<String>, responder: Responder) -> Self {
        Self {
            command: command.into(),
            responder,
        }
    }

    /// Deliver the outcome; a caller that stopped waiting is not an error
    pub fn respond(self, result: CommandResult) {
        if self.responder.send(result).is_err() {
            tracing::debug!("Caller stopped waiting for {:?}", self.command);
        }
    }
}

/// Future resolving to the response block of one command
///
/// Resolves to [`CommandError::Cancelled`] if the session drops the command
/// without answering it.
#[derive(Debug)]
pub struct ResponseFuture {
    command: String,
    state: ResponseState,
}

#[derive(Debug)]
enum ResponseState {
    Waiting(oneshot::Receiver<CommandResult>),
    Ready(Option<CommandError>),
}

impl ResponseFuture {
    /// Create a waiting future and the responder that completes it
    pub fn channel(command: impl Into<String>) -> (Self, Responder) {
        let (tx, rx) = oneshot::channel();
        let future = Self {
            command: command.into(),
            state: ResponseState::Waiting(rx),
        };
        (future, tx)
    }

    /// A future that fails immediately
    pub fn failed(command: impl Into<String>, error: CommandError) -> Self {
        Self {
            command: command.into(),
            state: ResponseState::Ready(Some(error)),
        }
    }

    /// The command this future answers
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Future for ResponseFuture {
    type Output = CommandResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ResponseState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(CommandError::Cancelled {
                    command: this.command.clone(),
                })),
                Poll::Pending => Poll::Pending,
            },
            ResponseState::Ready(error) => Poll::Ready(Err(error.take().unwrap_or(
                CommandError::Cancelled {
                    command: this.command.clone(),
                },
            ))),
        }
    }
}

/// FIFO of written commands and the response block being assembled
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    block: ResponseBlock,
    capacity: usize,
}

impl CommandQueue {
    /// Create an empty queue holding at most `capacity` pending commands
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            block: ResponseBlock::new(),
            capacity,
        }
    }

    /// Number of commands awaiting a response
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True if another command would exceed the capacity
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines accumulated for the block in progress
    pub fn partial_lines(&self) -> &[String] {
        &self.block.lines
    }

    /// Register a command that has just been written
    ///
    /// A full queue answers the responder with [`CommandError::QueueFull`]
    /// and returns `false`.
    pub fn push(&mut self, command: PendingCommand) -> bool {
        if self.is_full() {
            tracing::warn!(
                "Command queue full ({}), rejecting {:?}",
                self.capacity,
                command.command
            );
            command.respond(Err(CommandError::QueueFull {
                capacity: self.capacity,
            }));
            return false;
        }
        self.pending.push_back(command);
        true
    }

    /// Feed one classified line
    ///
    /// # Errors
    /// - [`ProtocolError::OrphanResponse`] when a block ends with no command
    ///   pending; the block is discarded
    /// - [`ProtocolError::UnrecognizedLine`] for [`LineClass::Unknown`]
    pub fn accept(&mut self, line: &str, class: LineClass) -> Result<(), ProtocolError> {
        match class {
            LineClass::Ignore => Ok(()),
            LineClass::Partial => {
                self.block.push(line);
                Ok(())
            }
            LineClass::End => {
                let mut block = std::mem::take(&mut self.block);
                block.push(line);
                match self.pending.pop_front() {
                    Some(pending) => {
                        block.command = Some(pending.command.clone());
                        tracing::debug!(
                            "Response to {:?} complete ({} lines)",
                            pending.command,
                            block.len()
                        );
                        pending.respond(Ok(block));
                        Ok(())
                    }
                    None => Err(ProtocolError::OrphanResponse { lines: block.lines }),
                }
            }
            LineClass::Unknown => Err(ProtocolError::UnrecognizedLine {
                line: line.to_string(),
            }),
        }
    }

    /// Reject every pending command with [`CommandError::Cancelled`]
    ///
    /// Returns how many commands were cancelled. The block in progress is
    /// discarded.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.block = ResponseBlock::new();
        for pending in self.pending.drain(..) {
            let command = pending.command.clone();
            pending.respond(Err(CommandError::Cancelled { command }));
        }
        if count > 0 {
            tracing::info!("Cancelled {} pending commands", count);
        }
        count
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(queue: &mut CommandQueue, command: &str) -> ResponseFuture {
        let (future, responder) = ResponseFuture::channel(command);
        queue.push(PendingCommand::new(command, responder));
        future
    }

    #[tokio::test]
    async fn test_partial_lines_join_block() {
        let mut queue = CommandQueue::new(4);
        let response = enqueue(&mut queue, "M114");

        queue.accept("X:1.00 Y:2.00 Z:3.00", LineClass::Partial).unwrap();
        assert_eq!(queue.partial_lines().len(), 1);
        queue.accept("ok", LineClass::End).unwrap();

        let block = response.await.unwrap();
        assert_eq!(block.command.as_deref(), Some("M114"));
        assert_eq!(block.lines, vec!["X:1.00 Y:2.00 Z:3.00", "ok"]);
        assert!(queue.is_empty());
        assert!(queue.partial_lines().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let mut queue = CommandQueue::new(1);
        let _first = enqueue(&mut queue, "G28");
        let second = enqueue(&mut queue, "M114");
        assert_eq!(second.await, Err(CommandError::QueueFull { capacity: 1 }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ignore_leaves_block_untouched() {
        let mut queue = CommandQueue::new(4);
        queue.accept("echo:busy: processing", LineClass::Ignore).unwrap();
        assert!(queue.partial_lines().is_empty());
    }

    #[tokio::test]
    async fn test_failed_future() {
        let future = ResponseFuture::failed("G28", CommandError::NotConnected);
        assert_eq!(future.command(), "G28");
        assert_eq!(future.await, Err(CommandError::NotConnected));
    }

    #[tokio::test]
    async fn test_dropping_queue_cancels() {
        let mut queue = CommandQueue::new(4);
        let response = enqueue(&mut queue, "G28");
        drop(queue);
        assert_eq!(
            response.await,
            Err(CommandError::Cancelled {
                command: "G28".to_string()
            })
        );
    }
}
