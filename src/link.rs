//! Remote conversational channel contract.
//!
//! The session controller talks to the remote agent through these traits;
//! the production WebSocket implementation lives in `live_link`, tests
//! substitute scripted fakes. Inbound traffic arrives as [`LinkEvent`]s on
//! an mpsc channel so the controller consumes it on its own timeline.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::TransportFrame;
use crate::error::AudioError;

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

/// One line of the running conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub role: Role,
    pub text: String,
}

impl TranscriptLine {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
        }
    }
}

/// Everything carried by one inbound channel message: zero or more audio
/// frames, zero or more transcript lines, and the turn flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerPayload {
    pub audio: Vec<TransportFrame>,
    pub lines: Vec<TranscriptLine>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

/// Inbound channel traffic, delivered to the controller's event queue.
#[derive(Debug)]
pub enum LinkEvent {
    /// The remote side acknowledged the session configuration.
    Opened,
    Message(ServerPayload),
    /// The channel closed; the controller decides whether that was
    /// expected.
    Closed,
    Error(AudioError),
}

/// Configuration for one conversation.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub system_prompt: String,
    pub voice_id: String,
}

/// Factory for conversation channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Establish the channel and start delivering inbound traffic to
    /// `events`. Resolves once outbound frames can be sent; failures are
    /// classified (`ChannelFailure` for anything network-shaped).
    async fn open(
        &self,
        params: OpenParams,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn ChannelHandle>, AudioError>;
}

/// One live conversation.
#[async_trait]
pub trait ChannelHandle: Send {
    /// Ship one capture frame to the remote side.
    async fn send(&mut self, frame: TransportFrame) -> Result<(), AudioError>;

    /// Close the channel. Idempotent; after this the event stream ends
    /// with at most one `Closed`.
    async fn close(&mut self);
}
