use std::fmt;

use tokio::sync::mpsc;

/// Message exchanged between a worker call and its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMessage {
    /// Unit to caller.
    Progress { completed: u64, total: u64 },
    /// Unit to caller, free-form diagnostic.
    Note(String),
    /// Caller to unit.
    Cancel,
}

/// One end of the duplex channel dedicated to a worker call.
pub struct WorkerPort {
    tx: mpsc::UnboundedSender<PortMessage>,
    rx: mpsc::UnboundedReceiver<PortMessage>,
    cancelled: bool,
}

impl fmt::Debug for WorkerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPort")
            .field("peer_closed", &self.tx.is_closed())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

/// Build the (caller, unit) ends of a fresh port.
pub fn port_pair() -> (WorkerPort, WorkerPort) {
    let (caller_tx, unit_rx) = mpsc::unbounded_channel();
    let (unit_tx, caller_rx) = mpsc::unbounded_channel();
    (
        WorkerPort {
            tx: caller_tx,
            rx: caller_rx,
            cancelled: false,
        },
        WorkerPort {
            tx: unit_tx,
            rx: unit_rx,
            cancelled: false,
        },
    )
}

impl WorkerPort {
    /// Returns `false` once the other end is gone.
    pub fn send(&self, message: PortMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn report_progress(&self, completed: u64, total: u64) {
        self.send(PortMessage::Progress { completed, total });
    }

    pub fn note(&self, note: impl Into<String>) {
        self.send(PortMessage::Note(note.into()));
    }

    pub fn cancel(&self) {
        self.send(PortMessage::Cancel);
    }

    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.rx.recv().await
    }

    /// Non-blocking poll of the unit side; usable from blocking code.
    pub fn cancellation_requested(&mut self) -> bool {
        while let Ok(message) = self.rx.try_recv() {
            if message == PortMessage::Cancel {
                self.cancelled = true;
            }
        }
        self.cancelled
    }
}
