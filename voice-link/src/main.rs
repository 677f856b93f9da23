//! voice-link: voice session process.
//!
//! Communicates with the host application via JSON-line IPC on
//! stdin/stdout. Initializes logging and configuration, spawns the session
//! manager and forwards its status changes as events.

use std::sync::Arc;

use tracing::{error, info, warn};

use voice_link::audio::{list_devices, list_output_devices, CpalBackend};
use voice_link::ipc::bridge::{spawn_stdin_reader, EventSink};
use voice_link::ipc::{AudioDeviceInfo, VoiceCommand, VoiceEvent};
use voice_link::{logging, AssistantConfig, LiveTransport, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = logging::init() {
        // Keep going with stderr only; the host still needs the IPC stream.
        eprintln!("File logging unavailable: {:#}", e);
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init()
            .ok();
    }

    let sink = EventSink::stdout();
    // Emit starting event immediately so the host knows we're alive.
    sink.emit(&VoiceEvent::Starting {});

    let config = AssistantConfig::load();
    if config.api_key.is_none() {
        warn!("No API credential configured; activation will fail until one is provided");
    }

    let transport = LiveTransport::new(&config.endpoint, config.api_key.clone())
        .with_connect_timeout(config.connect_timeout());
    let manager = SessionManager::spawn(
        config.session_config(),
        Arc::new(CpalBackend),
        Arc::new(transport),
    );

    let mut cmd_rx = spawn_stdin_reader(sink.clone());
    let mut status_rx = manager.status().subscribe();

    sink.emit(&VoiceEvent::Ready {});
    sink.emit(&VoiceEvent::Status(manager.status().snapshot()));
    info!("Voice link ready");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !handle_command(&manager, &sink, command).await {
                            break;
                        }
                    }
                    None => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    error!("Session manager stopped unexpectedly");
                    sink.error("Session manager stopped unexpectedly");
                    break;
                }
                let snapshot = status_rx.borrow_and_update().clone();
                sink.emit(&VoiceEvent::Status(snapshot));
            }
        }
    }

    manager.shutdown().await;
    sink.emit(&VoiceEvent::Stopping {});
    info!("Voice link shutting down");
    Ok(())
}

/// Handle a single command from the host.
/// Returns `false` if the main loop should exit.
async fn handle_command(manager: &SessionManager, sink: &EventSink, cmd: VoiceCommand) -> bool {
    match cmd {
        VoiceCommand::Activate {} => manager.activate(),
        VoiceCommand::Deactivate {} => manager.deactivate(),
        VoiceCommand::Retry {} => manager.retry(),

        VoiceCommand::GetStatus {} => {
            sink.emit(&VoiceEvent::Status(manager.status().snapshot()));
        }

        VoiceCommand::ListAudioDevices {} => {
            let (input, output) = match tokio::task::spawn_blocking(|| {
                (list_devices(), list_output_devices())
            })
            .await
            {
                Ok(names) => names,
                Err(e) => {
                    error!("Device enumeration failed: {}", e);
                    sink.error("Device enumeration failed");
                    return true;
                }
            };
            sink.emit(&VoiceEvent::AudioDevices {
                input: AudioDeviceInfo::from_names(input),
                output: AudioDeviceInfo::from_names(output),
            });
        }

        VoiceCommand::Ping {} => {
            sink.emit(&VoiceEvent::Pong {});
        }

        VoiceCommand::Stop {} => {
            info!("Stop requested");
            return false;
        }
    }

    true
}
