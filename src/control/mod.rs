//! The control channel: out-of-band commands from the UI.
//!
//! Commands arrive on an unbounded channel, each carrying its own oneshot
//! reply sender. The controller always replies — success or failure — and
//! never drops a command silently. The wire shapes mirror what the UI
//! sends: `{"type":"TAKEOVER"}`, `{"type":"PURGE"}`, and
//! `{"type":"WARM","items":[...]}`, with `{"success":true|false}` replies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::context::{ProxyContext, WarmItem};

/// A control command as the UI serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Activate the newest installed generation immediately instead of
    /// waiting for the next reload.
    #[serde(rename = "TAKEOVER")]
    Takeover,
    /// Delete all cache partitions across all generations.
    #[serde(rename = "PURGE")]
    Purge,
    /// Seed the un-versioned warm partition with UI-supplied payloads.
    #[serde(rename = "WARM")]
    Warm { items: Vec<WarmItem> },
}

/// Reply sent for every command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandReply {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// One in-flight command: the message plus its reply channel.
#[derive(Debug)]
pub struct Command {
    message: ControlMessage,
    reply: oneshot::Sender<CommandReply>,
}

/// Errors issuing a command.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel closed — proxy no longer running")]
    Closed,
}

/// Caller-side handle for issuing control commands.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    /// Sends a command and awaits its reply.
    ///
    /// # Errors
    ///
    /// [`ControlError::Closed`] if the proxy's control loop has exited.
    pub async fn send(&self, message: ControlMessage) -> Result<CommandReply, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command {
                message,
                reply: reply_tx,
            })
            .map_err(|_| ControlError::Closed)?;
        reply_rx.await.map_err(|_| ControlError::Closed)
    }

    /// Shorthand for [`ControlMessage::Takeover`].
    pub async fn takeover(&self) -> Result<CommandReply, ControlError> {
        self.send(ControlMessage::Takeover).await
    }

    /// Shorthand for [`ControlMessage::Purge`].
    pub async fn purge(&self) -> Result<CommandReply, ControlError> {
        self.send(ControlMessage::Purge).await
    }

    /// Shorthand for [`ControlMessage::Warm`].
    pub async fn warm(&self, items: Vec<WarmItem>) -> Result<CommandReply, ControlError> {
        self.send(ControlMessage::Warm { items }).await
    }
}

/// Creates a control handle and the receiver its commands arrive on.
pub fn channel() -> (ControlHandle, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlHandle { tx }, rx)
}

/// Serves control commands until every handle is dropped.
///
/// Runs independently of the request-interception path, typically as a
/// spawned task owned by the proxy.
pub async fn run_loop(ctx: Arc<ProxyContext>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(Command { message, reply }) = rx.recv().await {
        let outcome = dispatch(&ctx, message).await;
        if reply.send(outcome).is_err() {
            warn!("control command caller went away before the reply");
        }
    }
}

async fn dispatch(ctx: &ProxyContext, message: ControlMessage) -> CommandReply {
    match message {
        ControlMessage::Takeover => {
            info!(generation = ctx.lifecycle().generation(), "takeover requested");
            match ctx.lifecycle().activate(ctx.store()).await {
                Ok(evicted) => {
                    info!(evicted, "takeover complete");
                    CommandReply::ok()
                }
                Err(e) => {
                    warn!(error = %e, "takeover failed");
                    CommandReply::failed(e.to_string())
                }
            }
        }
        ControlMessage::Purge => {
            info!("purge requested — deleting all partitions");
            ctx.store().purge_all().await;
            CommandReply::ok()
        }
        ControlMessage::Warm { items } => {
            info!(items = items.len(), "warm requested");
            ctx.warm(items).await;
            CommandReply::ok()
        }
    }
}
