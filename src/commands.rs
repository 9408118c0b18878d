use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

// Requests the render/boot context hands to the service loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Connect {
        ssid: String,
        password: String,
        timeout: Duration,
    },
    Reset,
    Relink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Scan,
    Connect,
    Reset,
    Relink,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Scan => CommandKind::Scan,
            Command::Connect { .. } => CommandKind::Connect,
            Command::Reset => CommandKind::Reset,
            Command::Relink => CommandKind::Relink,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Scan => "scan",
            Command::Connect { .. } => "connect",
            Command::Reset => "reset",
            Command::Relink => "relink",
        }
    }
}

/// Create the producer/consumer ends of the command channel.
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, CommandReceiver { rx })
}

/// Cloneable producer end, held by the render loop and the boot sequence.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    /// Queue a command. Returns `false` if the service loop is gone.
    pub fn send(&self, command: Command) -> bool {
        trace!(command = command.name(), "Queueing command");
        self.tx.send(command).is_ok()
    }

    pub fn request_scan(&self) -> bool {
        self.send(Command::Scan)
    }

    pub fn request_connect(&self, ssid: &str, password: &str, timeout: Duration) -> bool {
        self.send(Command::Connect {
            ssid: ssid.to_string(),
            password: password.to_string(),
            timeout,
        })
    }

    pub fn request_reset(&self) -> bool {
        self.send(Command::Reset)
    }

    pub fn request_relink(&self) -> bool {
        self.send(Command::Relink)
    }
}

/// Consumer end, owned by the service loop.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl CommandReceiver {
    /// Take everything queued since the last drain, collapsing repeats.
    ///
    /// Each kind appears at most once, at the position of its first request.
    /// For `Connect` the most recent credentials win.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut pending: Vec<Command> = Vec::new();
        let mut received = 0usize;
        while let Ok(command) = self.rx.try_recv() {
            received += 1;
            match pending.iter_mut().find(|c| c.kind() == command.kind()) {
                Some(existing) => *existing = command,
                None => pending.push(command),
            }
        }
        if received > pending.len() {
            debug!(
                received,
                kept = pending.len(),
                "Coalesced duplicate commands"
            );
        }
        pending
    }
}
