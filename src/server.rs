// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The sound-server collaborator.
//!
//! `MixerControl` never talks to a sound server directly. It issues
//! [`Request`]s through a [`SoundServer`] implementation and is fed the
//! asynchronous results back as [`ServerEvent`]s on its own event loop.
//! Every issued request yields an [`OperationId`] that can later be canceled.

use crate::channel_volume::ChannelPosition;
use thiserror::Error;

/// Handle of a pending server operation.
pub type OperationId = u64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to connect to sound server: {0}")]
    ConnectionFailed(String),
    #[error("Sound server backend unavailable: {0}")]
    Unavailable(String),
}

/// Connection state reported by the server context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

/// Endpoint classes that accept volume/mute/port requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Sink,
    Source,
    SinkInput,
    SourceOutput,
}

/// Enumerations that end with an end-of-list marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Cards,
    Clients,
    Sinks,
    Sources,
    SinkInputs,
    SourceOutputs,
    StreamRestore,
}

/// Subscription facilities the control listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    Sink,
    Source,
    SinkInput,
    SourceOutput,
    Client,
    Server,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    NewOrChange,
    Remove,
}

/// Port availability as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAvailability {
    #[default]
    Unknown,
    No,
    Yes,
}

impl PortAvailability {
    /// Everything except an explicit "no" counts as usable.
    pub fn is_available(self) -> bool {
        self != Self::No
    }
}

/// Direction of a card port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// A port on a sink or source.
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub available: PortAvailability,
}

/// Sink or source description.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub card: Option<u32>,
    pub channel_map: Vec<ChannelPosition>,
    pub volume: Vec<u32>,
    pub mute: bool,
    pub base_volume: u32,
    pub decibel_volume: bool,
    pub ports: Vec<PortInfo>,
    pub active_port: Option<String>,
    pub icon_name: Option<String>,
    pub form_factor: Option<String>,
    /// Set for sources that monitor a sink.
    pub monitor_of_sink: Option<u32>,
}

/// Sink-input or source-output description.
#[derive(Debug, Clone, Default)]
pub struct AppStreamInfo {
    pub index: u32,
    pub name: String,
    pub client: Option<u32>,
    /// Sink (for sink-inputs) or source (for source-outputs) it is routed to.
    pub device: u32,
    pub channel_map: Vec<ChannelPosition>,
    pub volume: Vec<u32>,
    pub mute: bool,
    pub application_id: Option<String>,
    pub icon_name: Option<String>,
    pub media_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardProfileInfo {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub n_sinks: u32,
    pub n_sources: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardPortInfo {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub available: PortAvailability,
    pub direction: PortDirection,
    /// Names of the card profiles this port is usable with.
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CardInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub icon_name: Option<String>,
    pub profiles: Vec<CardProfileInfo>,
    pub active_profile: Option<String>,
    pub ports: Vec<CardPortInfo>,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub default_sink_name: Option<String>,
    pub default_source_name: Option<String>,
}

/// One entry of the server's persisted stream-routing store.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreEntry {
    pub name: String,
    pub channel_map: Vec<ChannelPosition>,
    pub volume: Vec<u32>,
    pub device: Option<String>,
    pub mute: bool,
}

/// Requests the control issues to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ServerInfo,
    /// `None` enumerates everything, `Some(index)` refreshes one object.
    Cards(Option<u32>),
    Clients(Option<u32>),
    Sinks(Option<u32>),
    Sources(Option<u32>),
    SinkInputs(Option<u32>),
    SourceOutputs(Option<u32>),
    StreamRestoreRead,
    StreamRestoreWrite(RestoreEntry),
    Subscribe,
    SetVolume {
        kind: EndpointKind,
        index: u32,
        volume: Vec<u32>,
    },
    SetMute {
        kind: EndpointKind,
        index: u32,
        mute: bool,
    },
    SetPort {
        kind: EndpointKind,
        index: u32,
        port: String,
    },
    SetCardProfile {
        index: u32,
        profile: String,
    },
    SetDefaultSink(String),
    SetDefaultSource(String),
}

/// Asynchronous notifications delivered back to the control.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ContextState(ContextState),
    ServerInfo(ServerInfo),
    Card(CardInfo),
    Client(ClientInfo),
    Sink(EndpointInfo),
    Source(EndpointInfo),
    SinkInput(AppStreamInfo),
    SourceOutput(AppStreamInfo),
    StreamRestore(RestoreEntry),
    ListEnd {
        kind: ListKind,
        success: bool,
    },
    Subscription {
        facility: Facility,
        change: SubscriptionChange,
        index: u32,
    },
    OperationComplete {
        id: OperationId,
        success: bool,
    },
}

/// Asynchronous RPC surface of a sound server.
pub trait SoundServer: Send {
    /// Create a fresh connection context, discarding any previous one.
    fn connect(&mut self) -> Result<(), ServerError>;

    /// Tear down the current context.
    fn disconnect(&mut self);

    /// Issue a request. `None` means the request could not be issued.
    fn request(&mut self, request: Request) -> Option<OperationId>;

    /// Cancel a still-pending operation. Its completion will not be reported.
    fn cancel(&mut self, id: OperationId);
}

/// Slot holding at most one pending operation of a given kind.
///
/// Storing a new operation cancels whatever was stored before.
#[derive(Debug, Default)]
pub struct OperationSlot(Option<OperationId>);

impl OperationSlot {
    pub fn replace(&mut self, server: &mut dyn SoundServer, id: OperationId) {
        if let Some(old) = self.0.replace(id) {
            server.cancel(old);
        }
    }

    pub fn cancel(&mut self, server: &mut dyn SoundServer) {
        if let Some(old) = self.0.take() {
            server.cancel(old);
        }
    }

    /// Clear the slot if `id` is the stored operation.
    pub fn complete(&mut self, id: OperationId) -> bool {
        if self.0 == Some(id) {
            self.0 = None;
            true
        } else {
            false
        }
    }

    /// Forget the stored handle without canceling (the context is gone).
    pub fn forget(&mut self) {
        self.0 = None;
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    pub fn id(&self) -> Option<OperationId> {
        self.0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording server used by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct MockLog {
        pub connects: usize,
        pub disconnects: usize,
        pub requests: Vec<(OperationId, Request)>,
        pub canceled: Vec<OperationId>,
        /// When set, every request fails to issue.
        pub refuse: bool,
        next_id: OperationId,
    }

    impl MockLog {
        /// Requests issued but neither canceled nor known to be finished.
        pub fn outstanding<F>(&self, filter: F) -> Vec<OperationId>
        where
            F: Fn(&Request) -> bool,
        {
            self.requests
                .iter()
                .filter(|(id, r)| filter(r) && !self.canceled.contains(id))
                .map(|(id, _)| *id)
                .collect()
        }

        pub fn last_id(&self) -> Option<OperationId> {
            self.requests.last().map(|(id, _)| *id)
        }

        pub fn contains(&self, request: &Request) -> bool {
            self.requests.iter().any(|(_, r)| r == request)
        }
    }

    #[derive(Clone, Default)]
    pub struct MockServer {
        pub log: Arc<Mutex<MockLog>>,
    }

    impl MockServer {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SoundServer for MockServer {
        fn connect(&mut self) -> Result<(), ServerError> {
            self.log.lock().connects += 1;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.log.lock().disconnects += 1;
        }

        fn request(&mut self, request: Request) -> Option<OperationId> {
            let mut log = self.log.lock();
            if log.refuse {
                return None;
            }
            log.next_id += 1;
            let id = log.next_id;
            log.requests.push((id, request));
            Some(id)
        }

        fn cancel(&mut self, id: OperationId) {
            self.log.lock().canceled.push(id);
        }
    }
}
