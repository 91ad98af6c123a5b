//! Inbound wire model for the Live API.
//!
//! Parses only what the session consumes; unknown fields are ignored so
//! server-side additions do not break the client.

use serde::Deserialize;

use crate::codec::TransportFrame;
use crate::link::{ServerPayload, TranscriptLine};

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<SetupComplete>,
    pub server_content: Option<ServerContent>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SetupComplete {}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

impl ServerContent {
    /// Flatten one message into what the session consumes: audio frames,
    /// transcript lines, and the turn flags.
    pub fn into_payload(self) -> ServerPayload {
        let mut payload = ServerPayload {
            interrupted: self.interrupted,
            turn_complete: self.turn_complete,
            ..ServerPayload::default()
        };

        if let Some(t) = self.input_transcription {
            if !t.text.is_empty() {
                payload.lines.push(TranscriptLine::user(t.text));
            }
        }

        if let Some(turn) = self.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        payload.lines.push(TranscriptLine::agent(text));
                    }
                }
                if let Some(inline) = part.inline_data {
                    payload.audio.push(TransportFrame {
                        data: inline.data,
                        mime_type: inline.mime_type,
                    });
                }
            }
        }

        if let Some(t) = self.output_transcription {
            if !t.text.is_empty() {
                payload.lines.push(TranscriptLine::agent(t.text));
            }
        }

        payload
    }
}
