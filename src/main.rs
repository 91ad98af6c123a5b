use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio::sync::mpsc;

use docutalk::audio::{AlsaInput, AlsaOutput};
use docutalk::config::Config;
use docutalk::link::Role;
use docutalk::live_link::LiveLink;
use docutalk::profile;
use docutalk::session::{SessionController, SessionIntent, SessionNotice, SessionState};

fn usage() {
    eprintln!("Usage: docutalk <document.txt> [voice]");
    eprint!("Voices:");
    for p in &profile::PROFILES {
        eprint!(" {}", p.id);
    }
    eprintln!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new();

    let mut args = std::env::args().skip(1);
    let doc_path = match args.next() {
        Some(p) => p,
        None => {
            usage();
            anyhow::bail!("missing document path");
        }
    };
    let voice_id = args.next().unwrap_or_else(|| config.default_voice.to_string());

    let profile = match profile::find(&voice_id) {
        Some(p) => p,
        None => {
            usage();
            anyhow::bail!("unknown voice '{}'", voice_id);
        }
    };

    let document = std::fs::read_to_string(&doc_path)
        .with_context(|| format!("Failed to read document '{}'", doc_path))?;
    let api_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY is not set; export it before starting")?;

    let params = profile.open_params(&document);

    // Wire the session core to the real collaborators.
    let input = Arc::new(AlsaInput::new(config.capture_device));
    let output = Arc::new(AlsaOutput::new(config.playback_device));
    let channel = Arc::new(LiveLink::new(config.live_url, config.model, api_key));

    let (intents, intent_rx) = mpsc::channel::<SessionIntent>(100);
    let (notice_tx, mut notices) = mpsc::channel::<SessionNotice>(100);

    let controller = SessionController::new(input, output, channel, intent_rx, notice_tx);
    let controller_task = tokio::spawn(controller.run());

    println!("{} v{}", config.app_name, config.app_version);
    println!("Document: {} ({} chars)", doc_path, document.chars().count());
    println!("Voice: {} ({})", profile.name, profile.voice);
    println!("Commands: m = mute/unmute, r = reset, c = connect, q = quit");

    if intents.send(SessionIntent::Connect(params.clone())).await.is_err() {
        anyhow::bail!("session ended before it started");
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut greeted = false;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(notice) = notices.recv() => {
                match notice {
                    SessionNotice::StateChanged(state) => {
                        println!("[session] {}", state.name());
                        match state {
                            SessionState::Active if !greeted => {
                                greeted = true;
                                println!("{}: {}", profile.name, profile.greeting);
                            }
                            SessionState::Errored(err) => {
                                eprintln!("Error: {}", err);
                                if err.is_retryable() {
                                    eprintln!("Press 'c' to reconnect.");
                                } else {
                                    eprintln!("Check the device, then press 'c' to retry.");
                                }
                            }
                            _ => {}
                        }
                    }
                    SessionNotice::Line(line) => {
                        let who = match line.role {
                            Role::User => "Tú",
                            Role::Agent => profile.name,
                        };
                        println!("{}: {}", who, line.text);
                    }
                }
            }

            line = lines.next_line() => {
                let cmd = match line {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) | Err(_) => break,
                };
                let intent = match cmd.trim() {
                    "m" => Some(SessionIntent::ToggleMute),
                    "r" => Some(SessionIntent::Reset),
                    "c" => Some(SessionIntent::Connect(params.clone())),
                    "q" => break,
                    "" => None,
                    other => {
                        println!("Unknown command '{}' (m, r, c, q)", other);
                        None
                    }
                };
                if let Some(intent) = intent {
                    if intents.send(intent).await.is_err() {
                        eprintln!("Session task is gone");
                        break;
                    }
                }
            }
        }
    }

    // Closing the intent channel tears the session down.
    drop(intents);
    let _ = controller_task.await;
    Ok(())
}
