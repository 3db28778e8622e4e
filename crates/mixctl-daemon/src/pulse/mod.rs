// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PulseAudio backend for the mixer control.
//!
//! [`PulseServer`] implements [`SoundServer`] by forwarding requests to a
//! dedicated mainloop thread. Results come back through [`PulseEvents`],
//! which the service drains on its own schedule and feeds to the control.
//! Events left over from a previous connection are dropped.

mod convert;
mod thread;

use mixctl::server::{OperationId, Request, ServerError, ServerEvent, SoundServer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use thiserror::Error;
use thread::{PulseCommand, PulseThread, ThreadSettings};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("PulseAudio initialization failed: {0}")]
    Init(&'static str),
    #[error("Failed to connect to PulseAudio: {0}")]
    Connect(String),
    #[error("PulseAudio thread error: {0}")]
    Thread(String),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct PulseSettings {
    pub server: Option<String>,
    pub client_name: String,
}

/// Create a backend and the receiving end of its events.
pub fn channel(settings: PulseSettings) -> (PulseServer, PulseEvents) {
    let (event_tx, event_rx) = mpsc::channel();
    let generation = Arc::new(AtomicU64::new(0));
    let server = PulseServer {
        settings,
        event_tx,
        generation: generation.clone(),
        worker: None,
        next_op: 0,
    };
    let events = PulseEvents {
        rx: event_rx,
        generation,
    };
    (server, events)
}

pub struct PulseServer {
    settings: PulseSettings,
    event_tx: mpsc::Sender<(u64, ServerEvent)>,
    /// Connection counter; bumped on every connect.
    generation: Arc<AtomicU64>,
    worker: Option<PulseThread>,
    next_op: OperationId,
}

impl PulseServer {
    fn send(&self, cmd: PulseCommand) -> bool {
        match &self.worker {
            Some(worker) => match worker.send(cmd) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to reach PulseAudio thread: {}", e);
                    false
                }
            },
            None => false,
        }
    }
}

impl SoundServer for PulseServer {
    fn connect(&mut self) -> Result<(), ServerError> {
        self.disconnect();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = ThreadSettings {
            server: self.settings.server.clone(),
            client_name: self.settings.client_name.clone(),
            generation,
        };
        let worker = PulseThread::spawn(settings, self.event_tx.clone())
            .map_err(|e| ServerError::Unavailable(e.to_string()))?;
        info!("PulseAudio connection {} started", generation);
        self.worker = Some(worker);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(
                "Stopping PulseAudio connection {}",
                self.generation.load(Ordering::SeqCst)
            );
            worker.shutdown();
        }
    }

    fn request(&mut self, request: Request) -> Option<OperationId> {
        if self.worker.is_none() {
            return None;
        }
        self.next_op += 1;
        let id = self.next_op;
        self.send(PulseCommand::Request { id, request }).then_some(id)
    }

    fn cancel(&mut self, id: OperationId) {
        self.send(PulseCommand::Cancel(id));
    }
}

/// Receiving end of the backend's events.
pub struct PulseEvents {
    rx: mpsc::Receiver<(u64, ServerEvent)>,
    generation: Arc<AtomicU64>,
}

impl PulseEvents {
    /// Everything received so far from the current connection.
    pub fn drain(&self) -> Vec<ServerEvent> {
        let current = self.generation.load(Ordering::SeqCst);
        self.rx
            .try_iter()
            .filter(|(generation, _)| *generation == current)
            .map(|(_, event)| event)
            .collect()
    }
}
