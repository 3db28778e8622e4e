// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Playback and capture endpoints.

use crate::channel_volume::{ChannelPosition, ChannelVolume, VolumeChange};
use crate::server::{
    EndpointKind, OperationId, OperationSlot, Request, RestoreEntry, SoundServer,
};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Stream-restore key of the synthetic system-sounds stream.
pub const EVENT_ROLE_RESTORE_NAME: &str = "sink-input-by-media-role:event";

/// Stable local identifier of a stream. Never reused, unlike server indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("{stream} does not support {operation}")]
    Unsupported {
        stream: StreamId,
        operation: &'static str,
    },
    #[error("Failed to issue {operation} for {stream}")]
    RequestFailed {
        stream: StreamId,
        operation: &'static str,
    },
}

/// What a stream is, with the data only that kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Sink,
    Source,
    /// Application playback routed to the sink with this index.
    SinkInput { sink: u32 },
    /// Application capture fed from the source with this index.
    SourceOutput { source: u32 },
    /// System sounds, persisted in the stream-restore store.
    EventRole { device: Option<String> },
}

impl StreamKind {
    fn endpoint(&self) -> Option<EndpointKind> {
        match self {
            StreamKind::Sink => Some(EndpointKind::Sink),
            StreamKind::Source => Some(EndpointKind::Source),
            StreamKind::SinkInput { .. } => Some(EndpointKind::SinkInput),
            StreamKind::SourceOutput { .. } => Some(EndpointKind::SourceOutput),
            StreamKind::EventRole { .. } => None,
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, StreamKind::Sink)
    }

    pub fn is_source(&self) -> bool {
        matches!(self, StreamKind::Source)
    }
}

/// A port on a sink or source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPort {
    pub name: String,
    pub human_name: String,
    pub priority: u32,
    pub available: bool,
}

#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    index: u32,
    kind: StreamKind,
    name: String,
    description: String,
    icon_name: Option<String>,
    application_id: Option<String>,
    form_factor: Option<String>,
    card_index: Option<u32>,
    port: Option<String>,
    ports: Vec<StreamPort>,
    is_muted: bool,
    can_decibel: bool,
    base_volume: u32,
    is_event_stream: bool,
    is_virtual: bool,
    channels: ChannelVolume,
    volume_op: OperationSlot,
}

impl Stream {
    pub fn new(id: StreamId, index: u32, kind: StreamKind, channel_map: &[ChannelPosition]) -> Self {
        let channels = if channel_map.is_empty() {
            ChannelVolume::mono()
        } else {
            ChannelVolume::new(channel_map.to_vec())
        };
        Self {
            id,
            index,
            kind,
            name: String::new(),
            description: String::new(),
            icon_name: None,
            application_id: None,
            form_factor: None,
            card_index: None,
            port: None,
            ports: Vec::new(),
            is_muted: false,
            can_decibel: false,
            base_volume: crate::channel_volume::VOLUME_NORM,
            is_event_stream: false,
            is_virtual: false,
            channels,
            volume_op: OperationSlot::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn icon_name(&self) -> Option<&str> {
        self.icon_name.as_deref()
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn form_factor(&self) -> Option<&str> {
        self.form_factor.as_deref()
    }

    pub fn card_index(&self) -> Option<u32> {
        self.card_index
    }

    /// Active port name.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn ports(&self) -> &[StreamPort] {
        &self.ports
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn can_decibel(&self) -> bool {
        self.can_decibel
    }

    pub fn base_volume(&self) -> u32 {
        self.base_volume
    }

    pub fn is_event_stream(&self) -> bool {
        self.is_event_stream
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn channels(&self) -> &ChannelVolume {
        &self.channels
    }

    pub fn volume(&self) -> u32 {
        self.channels.max_volume()
    }

    /// A volume push is awaiting confirmation from the server.
    pub fn is_running(&self) -> bool {
        self.volume_op.is_pending()
    }

    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub(crate) fn set_kind(&mut self, kind: StreamKind) {
        self.kind = kind;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub(crate) fn set_icon_name(&mut self, icon_name: Option<String>) {
        self.icon_name = icon_name;
    }

    pub(crate) fn set_application_id(&mut self, application_id: Option<String>) {
        self.application_id = application_id;
    }

    pub(crate) fn set_form_factor(&mut self, form_factor: Option<String>) {
        self.form_factor = form_factor;
    }

    pub(crate) fn set_card_index(&mut self, card_index: Option<u32>) {
        self.card_index = card_index;
    }

    pub(crate) fn set_is_muted(&mut self, is_muted: bool) {
        self.is_muted = is_muted;
    }

    pub(crate) fn set_can_decibel(&mut self, can_decibel: bool) {
        self.can_decibel = can_decibel;
    }

    pub(crate) fn set_base_volume(&mut self, base_volume: u32) {
        self.base_volume = base_volume;
    }

    pub(crate) fn set_is_event_stream(&mut self, is_event_stream: bool) {
        self.is_event_stream = is_event_stream;
    }

    pub(crate) fn set_is_virtual(&mut self, is_virtual: bool) {
        self.is_virtual = is_virtual;
    }

    /// Replace the port list, highest priority first.
    pub(crate) fn set_ports(&mut self, mut ports: Vec<StreamPort>) {
        ports.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.ports = ports;
    }

    /// Record the active port. Returns true only if it actually changed.
    pub(crate) fn set_port(&mut self, port: Option<&str>) -> bool {
        if self.port.as_deref() == port {
            return false;
        }
        trace!("{} port {:?} -> {:?}", self.id, self.port, port);
        self.port = port.map(str::to_string);
        true
    }

    /// Apply a layout and volume reported by the server.
    pub(crate) fn update_channels(
        &mut self,
        channel_map: &[ChannelPosition],
        volumes: &[u32],
    ) -> Option<VolumeChange> {
        if !channel_map.is_empty() {
            self.channels.set_positions(channel_map);
        }
        self.channels.volume_changed(volumes, false)
    }

    /// Apply a volume vector chosen by the user and push it to the server.
    ///
    /// Returns whether the stored vector changed.
    pub fn apply_volume(
        &mut self,
        server: &mut dyn SoundServer,
        volumes: &[u32],
    ) -> Result<bool, StreamError> {
        match self.channels.volume_changed(volumes, true) {
            Some(change) if change.user_initiated => {
                self.push_volume(server)?;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Scale the channel vector so the loudest channel is at `volume`.
    pub fn set_volume(&mut self, server: &mut dyn SoundServer, volume: u32) -> Result<bool, StreamError> {
        let volumes = self.channels.scaled(volume);
        self.apply_volume(server, &volumes)
    }

    /// Send the stored volume to the server, superseding any pending push.
    pub fn push_volume(&mut self, server: &mut dyn SoundServer) -> Result<(), StreamError> {
        if self.is_event_stream {
            trace!("{} is an event stream, volume follows the role entry", self.id);
            return Ok(());
        }

        let request = match (&self.kind, self.kind.endpoint()) {
            (StreamKind::EventRole { device }, _) => {
                Request::StreamRestoreWrite(self.restore_entry(device.clone(), self.is_muted))
            }
            (_, Some(kind)) => Request::SetVolume {
                kind,
                index: self.index,
                volume: self.channels.volumes().to_vec(),
            },
            (_, None) => {
                return Err(StreamError::Unsupported {
                    stream: self.id,
                    operation: "push_volume",
                })
            }
        };

        match server.request(request) {
            Some(id) => {
                debug!("{} volume push is operation {}", self.id, id);
                self.volume_op.replace(server, id);
                Ok(())
            }
            None => {
                warn!("Failed to push volume for {}", self.id);
                Err(StreamError::RequestFailed {
                    stream: self.id,
                    operation: "push_volume",
                })
            }
        }
    }

    /// Handle an operation completion. Returns false if it was not this
    /// stream's volume push.
    pub(crate) fn volume_push_finished(&mut self, id: OperationId, success: bool) -> bool {
        if !self.volume_op.complete(id) {
            return false;
        }
        if !success {
            warn!("Volume change for {} was rejected", self.id);
        }
        true
    }

    pub(crate) fn forget_pending(&mut self) {
        self.volume_op.forget();
    }

    pub fn change_is_muted(
        &mut self,
        server: &mut dyn SoundServer,
        is_muted: bool,
    ) -> Result<(), StreamError> {
        if self.is_muted == is_muted {
            return Ok(());
        }
        let request = match (&self.kind, self.kind.endpoint()) {
            (StreamKind::EventRole { device }, _) => {
                Request::StreamRestoreWrite(self.restore_entry(device.clone(), is_muted))
            }
            (_, Some(kind)) => Request::SetMute {
                kind,
                index: self.index,
                mute: is_muted,
            },
            (_, None) => {
                return Err(StreamError::Unsupported {
                    stream: self.id,
                    operation: "change_is_muted",
                })
            }
        };
        if server.request(request).is_none() {
            warn!("Failed to change mute for {}", self.id);
            return Err(StreamError::RequestFailed {
                stream: self.id,
                operation: "change_is_muted",
            });
        }
        self.is_muted = is_muted;
        Ok(())
    }

    /// Ask the server to switch the active port. Only sinks and sources have
    /// ports; the new port is applied when the server reports it.
    pub fn change_port(&mut self, server: &mut dyn SoundServer, port: &str) -> Result<(), StreamError> {
        let kind = match self.kind {
            StreamKind::Sink => EndpointKind::Sink,
            StreamKind::Source => EndpointKind::Source,
            _ => {
                return Err(StreamError::Unsupported {
                    stream: self.id,
                    operation: "change_port",
                })
            }
        };
        let request = Request::SetPort {
            kind,
            index: self.index,
            port: port.to_string(),
        };
        if server.request(request).is_none() {
            warn!("Failed to change port of {} to '{}'", self.id, port);
            return Err(StreamError::RequestFailed {
                stream: self.id,
                operation: "change_port",
            });
        }
        Ok(())
    }

    fn restore_entry(&self, device: Option<String>, mute: bool) -> RestoreEntry {
        RestoreEntry {
            name: EVENT_ROLE_RESTORE_NAME.to_string(),
            channel_map: self.channels.positions().to_vec(),
            volume: self.channels.volumes().to_vec(),
            device,
            mute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_volume::VOLUME_NORM;
    use crate::server::testing::MockServer;

    fn stereo_sink() -> Stream {
        let mut stream = Stream::new(
            StreamId(1),
            42,
            StreamKind::Sink,
            &[ChannelPosition::FrontLeft, ChannelPosition::FrontRight],
        );
        stream.update_channels(&[], &[VOLUME_NORM, VOLUME_NORM]);
        stream
    }

    #[test]
    fn test_push_volume_supersedes_previous() {
        let mut server = MockServer::new();
        let mut stream = stereo_sink();

        assert_eq!(stream.set_volume(&mut server, VOLUME_NORM / 2), Ok(true));
        assert!(stream.is_running());
        assert_eq!(stream.set_volume(&mut server, VOLUME_NORM / 4), Ok(true));

        let log = server.log.lock();
        assert_eq!(log.requests.len(), 2);
        assert_eq!(log.canceled, vec![log.requests[0].0]);
        assert!(log.contains(&Request::SetVolume {
            kind: EndpointKind::Sink,
            index: 42,
            volume: vec![VOLUME_NORM / 4, VOLUME_NORM / 4],
        }));
    }

    #[test]
    fn test_unchanged_volume_is_not_pushed() {
        let mut server = MockServer::new();
        let mut stream = stereo_sink();
        assert_eq!(stream.set_volume(&mut server, VOLUME_NORM), Ok(false));
        assert!(server.log.lock().requests.is_empty());
        assert!(!stream.is_running());
    }

    #[test]
    fn test_completion_clears_running() {
        let mut server = MockServer::new();
        let mut stream = stereo_sink();
        stream.set_volume(&mut server, 100).unwrap();
        let id = server.log.lock().last_id().unwrap();
        assert!(!stream.volume_push_finished(id + 1, true));
        assert!(stream.is_running());
        assert!(stream.volume_push_finished(id, true));
        assert!(!stream.is_running());
    }

    #[test]
    fn test_event_stream_push_is_noop() {
        let mut server = MockServer::new();
        let mut stream = Stream::new(
            StreamId(2),
            7,
            StreamKind::SinkInput { sink: 42 },
            &[ChannelPosition::Mono],
        );
        stream.set_is_event_stream(true);
        stream.update_channels(&[], &[VOLUME_NORM]);
        assert_eq!(stream.set_volume(&mut server, 10), Ok(true));
        assert!(server.log.lock().requests.is_empty());
        assert!(!stream.is_running());
    }

    #[test]
    fn test_event_role_writes_restore_entry() {
        let mut server = MockServer::new();
        let mut stream = Stream::new(
            StreamId(3),
            u32::MAX,
            StreamKind::EventRole {
                device: Some("alsa_output.analog".into()),
            },
            &[],
        );
        stream.update_channels(&[], &[VOLUME_NORM]);
        stream.change_is_muted(&mut server, true).unwrap();
        assert!(stream.is_muted());

        let log = server.log.lock();
        assert!(log.contains(&Request::StreamRestoreWrite(RestoreEntry {
            name: EVENT_ROLE_RESTORE_NAME.into(),
            channel_map: vec![ChannelPosition::Mono],
            volume: vec![VOLUME_NORM],
            device: Some("alsa_output.analog".into()),
            mute: true,
        })));
    }

    #[test]
    fn test_change_port_unsupported_for_app_streams() {
        let mut server = MockServer::new();
        let mut stream = Stream::new(
            StreamId(4),
            9,
            StreamKind::SourceOutput { source: 1 },
            &[ChannelPosition::Mono],
        );
        assert_eq!(
            stream.change_port(&mut server, "analog-input-mic"),
            Err(StreamError::Unsupported {
                stream: StreamId(4),
                operation: "change_port",
            })
        );

        let mut sink = stereo_sink();
        sink.change_port(&mut server, "analog-output-headphones").unwrap();
        assert!(server.log.lock().contains(&Request::SetPort {
            kind: EndpointKind::Sink,
            index: 42,
            port: "analog-output-headphones".into(),
        }));
        assert_eq!(sink.port(), None);
    }

    #[test]
    fn test_mute_request_failure_keeps_state() {
        let mut server = MockServer::new();
        server.log.lock().refuse = true;
        let mut stream = stereo_sink();
        assert!(stream.change_is_muted(&mut server, true).is_err());
        assert!(!stream.is_muted());
    }

    #[test]
    fn test_set_port_reports_changes_only() {
        let mut stream = stereo_sink();
        assert!(stream.set_port(Some("hdmi-output")));
        assert!(!stream.set_port(Some("hdmi-output")));
        assert!(stream.set_port(None));
    }
}
