//! IPC bridge between the host pipes and the session process.
//!
//! Every outgoing line goes through one [`EventSink`], so status updates from
//! the main loop and rejections from the command reader never interleave
//! mid-line. Commands are read on a blocking thread and handed to the async
//! side over an unbounded channel.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{VoiceCommand, VoiceEvent};

/// Shared, line-oriented event writer.
#[derive(Clone)]
pub struct EventSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one event as a JSON line and flush.
    pub fn emit(&self, event: &VoiceEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                return;
            }
        };
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Pipe may be closed.
        let _ = writeln!(out, "{}", json);
        let _ = out.flush();
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(&VoiceEvent::Error {
            message: message.into(),
        });
    }
}

/// Parse one input line. The error text is what the host gets back.
pub fn parse_command(line: &str) -> Result<VoiceCommand, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("Invalid JSON command: {}", e))?;
    let name = match value.get("command") {
        Some(serde_json::Value::String(name)) => name.clone(),
        Some(_) => return Err("Command name must be a string".into()),
        None => return Err("Missing \"command\" field".into()),
    };
    serde_json::from_value(value).map_err(|_| format!("Unknown command: {}", name))
}

/// Read commands from `input` on a dedicated thread.
///
/// Rejected lines are answered with an error event on `sink`. The thread
/// exits at end of input, on a read error, or once the receiver is gone.
pub fn spawn_command_reader<R>(input: R, sink: EventSink) -> mpsc::UnboundedReceiver<VoiceCommand>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        for line in input.lines() {
            let text = match line {
                Ok(text) => text,
                Err(e) => {
                    error!("Command input read error: {}", e);
                    break;
                }
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_command(trimmed) {
                Ok(cmd) => {
                    debug!(?cmd, "Received command from host");
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(message) => {
                    warn!(input = %trimmed, "{}", message);
                    sink.error(message);
                }
            }
        }
        debug!("Command reader exiting");
    });

    rx
}

/// [`spawn_command_reader`] over the process stdin.
pub fn spawn_stdin_reader(sink: EventSink) -> mpsc::UnboundedReceiver<VoiceCommand> {
    spawn_command_reader(io::BufReader::new(io::stdin()), sink)
}
