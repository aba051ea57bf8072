//! In-process chat sources for tests and local demos.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ChatMessage, ChatRequest, ChatSource, MessageStream};
use crate::error::SourceError;

/// One scripted step of a `MemorySource`.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Message(ChatMessage),
    /// Fault surfaced mid-stream.
    Fail(String),
}

/// Replays a fixed script on every `open`.
///
/// Honours `max_messages` and the time budget unless told otherwise, like a
/// well-behaved platform source would.
#[derive(Debug, Default)]
pub struct MemorySource {
    script: Vec<ScriptStep>,
    delay: Duration,
    hang_after_script: bool,
    ignore_limits: bool,
    open_error: Option<String>,
    open_delay: Duration,
    opened: AtomicUsize,
}

impl MemorySource {
    /// Source yielding the given messages.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            script: messages.into_iter().map(ScriptStep::Message).collect(),
            ..Self::default()
        }
    }

    /// Source yielding `count` numbered messages.
    pub fn numbered(count: usize) -> Self {
        Self::new(
            (1..=count)
                .map(|i| ChatMessage::new(format!("user{}", i % 7), format!("message {i}")))
                .collect(),
        )
    }

    pub fn from_script(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Wait this long before yielding each step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the stream open forever once the script is exhausted.
    pub fn hang_after_script(mut self) -> Self {
        self.hang_after_script = true;
        self
    }

    /// Ignore `max_messages` and the time budget.
    pub fn ignore_limits(mut self) -> Self {
        self.ignore_limits = true;
        self
    }

    /// Fail every `open` with the given reason.
    pub fn fail_on_open(mut self, reason: impl Into<String>) -> Self {
        self.open_error = Some(reason.into());
        self
    }

    /// Wait this long before `open` returns.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Number of times `open` has been called.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self, request: &ChatRequest) -> Result<MessageStream, SourceError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(reason) = &self.open_error {
            return Err(SourceError::Request(reason.clone()));
        }

        let delay = self.delay;
        let steps = stream::iter(self.script.clone()).then(move |step| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match step {
                ScriptStep::Message(msg) => Ok(msg),
                ScriptStep::Fail(reason) => Err(SourceError::Request(reason)),
            }
        });

        let steps: MessageStream = if self.hang_after_script {
            steps.chain(stream::pending()).boxed()
        } else {
            steps.boxed()
        };

        if self.ignore_limits {
            return Ok(steps);
        }

        let limited: MessageStream = match request.max_messages {
            Some(max) => steps.take(max as usize).boxed(),
            None => steps,
        };
        Ok(limited
            .take_until(tokio::time::sleep(request.timeout))
            .boxed())
    }
}

/// Live source fed by a channel; the stream ends when the sender is dropped.
///
/// Only the first `open` receives the stream.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<Result<ChatMessage, SourceError>>>>,
}

impl ChannelSource {
    /// Create the source and the sender that feeds it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Result<ChatMessage, SourceError>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl ChatSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn open(&self, _request: &ChatRequest) -> Result<MessageStream, SourceError> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| SourceError::Request("channel source lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| SourceError::Request("channel source already opened".to_string()))?;
        Ok(ReceiverStream::new(rx).boxed())
    }
}
