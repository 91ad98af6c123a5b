//! Live API channel over WebSocket.
//!
//! The one network surface of this client: connect with the credential as
//! a query parameter, send the session setup, then bridge the socket to
//! the controller's event queue. There is no automatic reconnect; a
//! dropped socket surfaces as an event and recovery is a fresh connect.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::codec::TransportFrame;
use crate::error::AudioError;
use crate::link::{Channel, ChannelHandle, LinkEvent, OpenParams};
use crate::protocol::ServerMessage;

const OUTBOUND_QUEUE: usize = 100;

// ======================== Outbound wire messages ========================

#[derive(Serialize)]
struct SetupEnvelope {
    setup: Setup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    input_audio_transcription: EmptyConfig,
    output_audio_transcription: EmptyConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
struct EmptyConfig {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeEnvelope {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

// ======================== Channel implementation ========================

enum OutboundCmd {
    Media(TransportFrame),
    Close,
}

/// Live API endpoint plus the credential supplied by the application.
pub struct LiveLink {
    endpoint: String,
    model: String,
    api_key: String,
}

impl LiveLink {
    /// * `endpoint` - `BidiGenerateContent` WebSocket URL
    /// * `model`    - model name, with or without the `models/` prefix
    /// * `api_key`  - credential appended as the `key` query parameter
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let model = model.into();
        let model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{}", model)
        };
        Self {
            endpoint: endpoint.into(),
            model,
            api_key: api_key.into(),
        }
    }

    fn setup_envelope(&self, params: &OpenParams) -> SetupEnvelope {
        SetupEnvelope {
            setup: Setup {
                model: self.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: params.voice_id.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: params.system_prompt.clone(),
                    }],
                },
                input_audio_transcription: EmptyConfig {},
                output_audio_transcription: EmptyConfig {},
            },
        }
    }
}

/// Parse one server frame into the event the controller consumes.
/// Malformed frames are logged and dropped, never fatal.
fn server_event(raw: &[u8]) -> Option<LinkEvent> {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(msg) => {
            if msg.setup_complete.is_some() {
                Some(LinkEvent::Opened)
            } else if let Some(content) = msg.server_content {
                Some(LinkEvent::Message(content.into_payload()))
            } else {
                log::debug!("Server message with nothing to handle");
                None
            }
        }
        Err(e) => {
            log::warn!("Malformed server message dropped: {}", e);
            None
        }
    }
}

#[async_trait]
impl Channel for LiveLink {
    async fn open(
        &self,
        params: OpenParams,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn ChannelHandle>, AudioError> {
        let mut endpoint = Url::parse(&self.endpoint)
            .map_err(|e| AudioError::channel(format!("bad endpoint: {}", e)))?;
        endpoint.query_pairs_mut().append_pair("key", &self.api_key);

        log::info!("Connecting to {}", self.endpoint);
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| AudioError::channel(format!("connect failed: {}", e)))?;
        let (mut write, mut read) = ws.split();

        // Setup must be the first frame on the wire.
        let setup = serde_json::to_string(&self.setup_envelope(&params))
            .map_err(|e| AudioError::unknown(format!("encode setup: {}", e)))?;
        write
            .send(Message::Text(setup.into()))
            .await
            .map_err(|e| AudioError::channel(format!("send setup: {}", e)))?;
        log::info!("Channel open, setup sent (voice {})", params.voice_id);

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundCmd>(OUTBOUND_QUEUE);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(ev) = server_event(text.as_bytes()) {
                                    if events.send(ev).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                // The service also ships JSON in binary frames.
                                if let Some(ev) = server_event(&data) {
                                    if events.send(ev).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                log::info!("Channel closed by remote: {:?}", frame);
                                let _ = events.send(LinkEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = events
                                    .send(LinkEvent::Error(AudioError::channel(format!(
                                        "socket error: {}",
                                        e
                                    ))))
                                    .await;
                                break;
                            }
                            None => {
                                let _ = events.send(LinkEvent::Closed).await;
                                break;
                            }
                        }
                    }
                    cmd = out_rx.recv() => {
                        match cmd {
                            Some(OutboundCmd::Media(frame)) => {
                                let envelope = RealtimeEnvelope {
                                    realtime_input: RealtimeInput {
                                        media_chunks: vec![MediaChunk {
                                            mime_type: frame.mime_type,
                                            data: frame.data,
                                        }],
                                    },
                                };
                                match serde_json::to_string(&envelope) {
                                    Ok(json) => {
                                        if let Err(e) = write.send(Message::Text(json.into())).await {
                                            let _ = events
                                                .send(LinkEvent::Error(AudioError::channel(
                                                    format!("send failed: {}", e),
                                                )))
                                                .await;
                                            break;
                                        }
                                    }
                                    Err(e) => log::error!("Failed to encode media chunk: {}", e),
                                }
                            }
                            Some(OutboundCmd::Close) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("Channel io task finished");
        });

        Ok(Box::new(LiveHandle { out: out_tx }))
    }
}

struct LiveHandle {
    out: mpsc::Sender<OutboundCmd>,
}

#[async_trait]
impl ChannelHandle for LiveHandle {
    async fn send(&mut self, frame: TransportFrame) -> Result<(), AudioError> {
        self.out
            .send(OutboundCmd::Media(frame))
            .await
            .map_err(|_| AudioError::channel("channel task gone"))
    }

    async fn close(&mut self) {
        let _ = self.out.send(OutboundCmd::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_params() -> OpenParams {
        OpenParams {
            system_prompt: "docs only".into(),
            voice_id: "Puck".into(),
        }
    }

    #[test]
    fn setup_envelope_has_the_wire_shape() {
        let link = LiveLink::new("wss://example.invalid/ws", "gemini-test", "k");
        let v = serde_json::to_value(link.setup_envelope(&test_params())).unwrap();

        assert_eq!(v["setup"]["model"], "models/gemini-test");
        assert_eq!(v["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            v["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(v["setup"]["systemInstruction"]["parts"][0]["text"], "docs only");
        assert!(v["setup"]["inputAudioTranscription"].is_object());
        assert!(v["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn model_prefix_is_not_doubled() {
        let link = LiveLink::new("wss://example.invalid/ws", "models/gemini-test", "k");
        let v = serde_json::to_value(link.setup_envelope(&test_params())).unwrap();
        assert_eq!(v["setup"]["model"], "models/gemini-test");
    }

    #[test]
    fn media_envelope_has_the_wire_shape() {
        let envelope = RealtimeEnvelope {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: "audio/pcm;rate=16000".into(),
                    data: "AAECAw==".into(),
                }],
            },
        };
        let v = serde_json::to_value(envelope).unwrap();
        assert_eq!(
            v["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert_eq!(v["realtimeInput"]["mediaChunks"][0]["data"], "AAECAw==");
    }

    #[test]
    fn malformed_server_frames_are_dropped() {
        assert!(server_event(b"not json at all").is_none());
        assert!(server_event(br#"{"goAway": {}}"#).is_none());
        assert!(matches!(
            server_event(br#"{"setupComplete": {}}"#),
            Some(LinkEvent::Opened)
        ));
    }

    #[tokio::test]
    async fn exchanges_with_a_local_server() {
        use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let uri = Arc::new(Mutex::new(String::new()));
            let uri_probe = uri.clone();
            let mut ws = tokio_tungstenite::accept_hdr_async(
                stream,
                move |req: &Request, resp: Response| {
                    *uri_probe.lock().unwrap() = req.uri().to_string();
                    Ok(resp)
                },
            )
            .await
            .unwrap();

            // First frame must be the setup envelope.
            let setup_raw = ws.next().await.unwrap().unwrap();
            let setup: Value = serde_json::from_str(setup_raw.to_text().unwrap()).unwrap();

            ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}]}}}"#.into(),
            ))
            .await
            .unwrap();

            let media_raw = ws.next().await.unwrap().unwrap();
            let media: Value = serde_json::from_str(media_raw.to_text().unwrap()).unwrap();

            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            let uri = uri.lock().unwrap().clone();
            (uri, setup, media)
        });

        let link = LiveLink::new(format!("ws://{}", addr), "gemini-test", "sekrit");
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        let mut handle = link.open(test_params(), ev_tx).await.unwrap();

        match timeout(Duration::from_secs(5), ev_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            LinkEvent::Opened => {}
            other => panic!("expected Opened, got {:?}", other),
        }
        let payload = match timeout(Duration::from_secs(5), ev_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            LinkEvent::Message(p) => p,
            other => panic!("expected Message, got {:?}", other),
        };
        assert_eq!(payload.audio.len(), 1);
        assert_eq!(payload.audio[0].data, "AAAA");
        assert_eq!(payload.audio[0].mime_type, "audio/pcm;rate=24000");

        handle
            .send(TransportFrame {
                data: "UENN".into(),
                mime_type: "audio/pcm;rate=16000".into(),
            })
            .await
            .unwrap();
        handle.close().await;

        let (uri, setup, media) = server.await.unwrap();
        assert!(uri.contains("key=sekrit"), "credential missing from {}", uri);
        assert_eq!(setup["setup"]["model"], "models/gemini-test");
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(
            media["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert_eq!(media["realtimeInput"]["mediaChunks"][0]["data"], "UENN");
    }
}
