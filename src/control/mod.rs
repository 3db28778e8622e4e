// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The mixer control: owns every registry, follows the sound server and
//! reports changes to a single consumer.
//!
//! All state lives in one [`MixerControl`] value driven from one thread.
//! Sound-server results arrive through [`MixerControl::handle_event`];
//! consumers learn about changes from the [`MixerEvent`]s pushed into the
//! channel registered with [`MixerControl::set_event_sender`].

mod sync;
mod update;


use crate::card::{Card, CardError, CardId};
use crate::channel_volume::VolumeChange;
use crate::server::{Request, ServerError, ServerEvent, SoundServer};
use crate::stream::{Stream, StreamError, StreamId, StreamKind};
use crate::ui_device::{DeviceId, Direction, UIDevice};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Connection state of the control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    Closed,
    Connecting,
    Ready,
    Failed,
}

impl MixerState {
    pub fn as_str(self) -> &'static str {
        match self {
            MixerState::Closed => "closed",
            MixerState::Connecting => "connecting",
            MixerState::Ready => "ready",
            MixerState::Failed => "failed",
        }
    }
}

/// Events reported to the consumer, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerEvent {
    StateChanged(MixerState),
    StreamAdded(StreamId),
    StreamRemoved(StreamId),
    /// Server index of the card.
    CardAdded(u32),
    CardRemoved(u32),
    DefaultSinkChanged(Option<StreamId>),
    DefaultSourceChanged(Option<StreamId>),
    ActiveOutputUpdate(DeviceId),
    ActiveInputUpdate(DeviceId),
    OutputAdded(DeviceId),
    InputAdded(DeviceId),
    OutputRemoved(DeviceId),
    InputRemoved(DeviceId),
    StreamVolumeChanged(StreamId),
    StreamPortChanged(StreamId),
}

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("Unknown card: {0}")]
    UnknownCard(CardId),
    #[error("{0} is not attached to a card")]
    NoCard(DeviceId),
    #[error("No profile to switch {0} to")]
    NoProfile(DeviceId),
    #[error("Sound server is not ready ({})", .0.as_str())]
    NotReady(MixerState),
    #[error("Failed to issue {0}")]
    RequestFailed(&'static str),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Card(#[from] CardError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Tunables of the control.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// Delay between a connection failure and the next attempt.
    pub reconnect_delay: Duration,
    /// Read the stream-restore store during the initial enumeration.
    pub restore_event_role: bool,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            restore_event_role: true,
        }
    }
}

/// Tracking of the server's default sink or source.
#[derive(Debug, Default)]
struct DefaultEndpoint {
    /// Name as last reported by the server.
    name: Option<String>,
    id: Option<StreamId>,
    /// Stream whose port changes are reported as active-device updates.
    port_watch: Option<StreamId>,
}

pub struct MixerControl {
    server: Box<dyn SoundServer>,
    options: ControlOptions,
    state: MixerState,
    event_tx: Option<UnboundedSender<MixerEvent>>,

    /// Initial enumeration requests still awaiting their final callback.
    n_outstanding: u32,
    /// The initial stream-restore read has not finished yet.
    awaiting_restore: bool,
    /// Stream-restore reads in flight.
    restore_reads: u32,
    restore_retarget_sink: Option<String>,
    restore_retarget_source: Option<String>,
    reconnect_at: Option<Instant>,

    next_stream_id: u32,
    next_card_id: u32,
    next_device_id: u32,

    all_streams: BTreeMap<StreamId, Stream>,
    sinks: HashMap<u32, StreamId>,
    sources: HashMap<u32, StreamId>,
    sink_inputs: HashMap<u32, StreamId>,
    source_outputs: HashMap<u32, StreamId>,

    cards: BTreeMap<CardId, Card>,
    card_indices: HashMap<u32, CardId>,
    /// Cards carried over a reconnect and not yet reported again.
    stale_cards: HashSet<CardId>,

    clients: HashMap<u32, String>,

    ui_outputs: BTreeMap<DeviceId, UIDevice>,
    ui_inputs: BTreeMap<DeviceId, UIDevice>,

    default_sink: DefaultEndpoint,
    default_source: DefaultEndpoint,

    event_sink_input_id: Option<StreamId>,
    profile_swapping_device_id: Option<DeviceId>,
}

impl MixerControl {
    pub fn new(server: Box<dyn SoundServer>, options: ControlOptions) -> Self {
        Self {
            server,
            options,
            state: MixerState::Closed,
            event_tx: None,
            n_outstanding: 0,
            awaiting_restore: false,
            restore_reads: 0,
            restore_retarget_sink: None,
            restore_retarget_source: None,
            reconnect_at: None,
            next_stream_id: 1,
            next_card_id: 1,
            next_device_id: 1,
            all_streams: BTreeMap::new(),
            sinks: HashMap::new(),
            sources: HashMap::new(),
            sink_inputs: HashMap::new(),
            source_outputs: HashMap::new(),
            cards: BTreeMap::new(),
            card_indices: HashMap::new(),
            stale_cards: HashSet::new(),
            clients: HashMap::new(),
            ui_outputs: BTreeMap::new(),
            ui_inputs: BTreeMap::new(),
            default_sink: DefaultEndpoint::default(),
            default_source: DefaultEndpoint::default(),
            event_sink_input_id: None,
            profile_swapping_device_id: None,
        }
    }

    /// Set the channel that receives [`MixerEvent`]s.
    pub fn set_event_sender(&mut self, tx: UnboundedSender<MixerEvent>) {
        self.event_tx = Some(tx);
    }

    fn emit(&self, event: MixerEvent) {
        trace!("Mixer event: {:?}", event);
        if let Some(ref tx) = self.event_tx {
            if tx.send(event).is_err() {
                trace!("Mixer event receiver is gone");
            }
        }
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    fn set_state(&mut self, state: MixerState) {
        if self.state == state {
            return;
        }
        info!("Mixer state: {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        self.emit(MixerEvent::StateChanged(state));
    }

    // ==================== Lifecycle ====================

    /// Start connecting to the sound server.
    pub fn open(&mut self) -> Result<(), MixerError> {
        if matches!(self.state, MixerState::Connecting | MixerState::Ready) {
            return Ok(());
        }
        self.reconnect_at = None;
        match self.server.connect() {
            Ok(()) => {
                self.set_state(MixerState::Connecting);
                Ok(())
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.schedule_reconnect(Instant::now());
                self.set_state(MixerState::Failed);
                Err(e.into())
            }
        }
    }

    /// Disconnect and stop reconnecting.
    pub fn close(&mut self) {
        if self.state == MixerState::Closed {
            return;
        }
        self.server.disconnect();
        self.reconnect_at = None;
        self.n_outstanding = 0;
        self.set_state(MixerState::Closed);
    }

    /// Drive the reconnect timer.
    pub fn tick(&mut self, now: Instant) {
        let Some(at) = self.reconnect_at else {
            return;
        };
        if self.state != MixerState::Failed || now < at {
            return;
        }
        info!("Reconnecting to sound server");
        if let Err(e) = self.open() {
            debug!("Reconnect failed: {}", e);
        }
    }

    /// When the next reconnect attempt is due.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.reconnect_at = Some(now + self.options.reconnect_delay);
    }

    /// Feed one sound-server notification into the control.
    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ContextState(state) => self.on_context_state(state),
            ServerEvent::ServerInfo(info) => self.update_server(&info),
            ServerEvent::Card(info) => self.update_card(&info),
            ServerEvent::Client(info) => self.update_client(&info),
            ServerEvent::Sink(info) => self.update_sink(&info),
            ServerEvent::Source(info) => self.update_source(&info),
            ServerEvent::SinkInput(info) => self.update_sink_input(&info),
            ServerEvent::SourceOutput(info) => self.update_source_output(&info),
            ServerEvent::StreamRestore(entry) => self.update_restore_entry(entry),
            ServerEvent::ListEnd { kind, success } => self.on_list_end(kind, success),
            ServerEvent::Subscription {
                facility,
                change,
                index,
            } => self.on_subscription(facility, change, index),
            ServerEvent::OperationComplete { id, success } => self.on_operation_complete(id, success),
        }
    }

    // ==================== Accessors ====================

    fn registry(&self, kind: &StreamKind) -> Option<&HashMap<u32, StreamId>> {
        match kind {
            StreamKind::Sink => Some(&self.sinks),
            StreamKind::Source => Some(&self.sources),
            StreamKind::SinkInput { .. } => Some(&self.sink_inputs),
            StreamKind::SourceOutput { .. } => Some(&self.source_outputs),
            StreamKind::EventRole { .. } => None,
        }
    }

    fn collect(&self, registry: &HashMap<u32, StreamId>) -> Vec<&Stream> {
        let mut streams: Vec<&Stream> = registry
            .values()
            .filter_map(|id| self.all_streams.get(id))
            .collect();
        streams.sort_by_key(|s| s.id());
        streams
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.all_streams.values()
    }

    pub fn sinks(&self) -> Vec<&Stream> {
        self.collect(&self.sinks)
    }

    pub fn sources(&self) -> Vec<&Stream> {
        self.collect(&self.sources)
    }

    pub fn sink_inputs(&self) -> Vec<&Stream> {
        self.collect(&self.sink_inputs)
    }

    pub fn source_outputs(&self) -> Vec<&Stream> {
        self.collect(&self.source_outputs)
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &UIDevice> {
        self.ui_outputs.values()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &UIDevice> {
        self.ui_inputs.values()
    }

    pub fn lookup_stream_id(&self, id: StreamId) -> Option<&Stream> {
        self.all_streams.get(&id)
    }

    pub fn lookup_card_id(&self, id: CardId) -> Option<&Card> {
        self.cards.get(&id)
    }

    /// Card by server index.
    pub fn lookup_card_index(&self, index: u32) -> Option<&Card> {
        self.card_indices.get(&index).and_then(|id| self.cards.get(id))
    }

    pub fn lookup_output_id(&self, id: DeviceId) -> Option<&UIDevice> {
        self.ui_outputs.get(&id)
    }

    pub fn lookup_input_id(&self, id: DeviceId) -> Option<&UIDevice> {
        self.ui_inputs.get(&id)
    }

    fn lookup_device(&self, id: DeviceId) -> Option<&UIDevice> {
        self.ui_outputs.get(&id).or_else(|| self.ui_inputs.get(&id))
    }

    fn devices(&self, direction: Direction) -> &BTreeMap<DeviceId, UIDevice> {
        match direction {
            Direction::Output => &self.ui_outputs,
            Direction::Input => &self.ui_inputs,
        }
    }

    fn devices_mut(&mut self, direction: Direction) -> &mut BTreeMap<DeviceId, UIDevice> {
        match direction {
            Direction::Output => &mut self.ui_outputs,
            Direction::Input => &mut self.ui_inputs,
        }
    }

    /// The live stream currently realizing `device`, if any.
    pub fn stream_from_device(&self, device: &UIDevice) -> Option<&Stream> {
        let Some(id) = device.stream_id() else {
            trace!("{} has no stream", device.id());
            return None;
        };
        self.all_streams.get(&id)
    }

    pub fn default_sink(&self) -> Option<&Stream> {
        self.default_sink.id.and_then(|id| self.all_streams.get(&id))
    }

    pub fn default_source(&self) -> Option<&Stream> {
        self.default_source.id.and_then(|id| self.all_streams.get(&id))
    }

    /// The synthetic system-sounds stream.
    pub fn event_sink_input(&self) -> Option<&Stream> {
        self.event_sink_input_id.and_then(|id| self.all_streams.get(&id))
    }

    pub fn client_name(&self, index: u32) -> Option<&str> {
        self.clients.get(&index).map(String::as_str)
    }

    /// Entry of the device's reduced profile list matching its card's
    /// active profile.
    pub fn device_active_profile<'a>(&self, device: &'a UIDevice) -> Option<&'a str> {
        let card = device.card().and_then(|id| self.cards.get(&id))?;
        let active = card.active_profile()?;
        device.matching_profile(active)
    }

    // ==================== User operations ====================

    /// Switch the card behind `device` to the best profile for `profile`.
    ///
    /// The device is remembered so that the stream appearing after the switch
    /// becomes the default even if the server picked its own fallback.
    pub fn change_profile_on_selected_device(
        &mut self,
        device_id: DeviceId,
        profile: Option<&str>,
    ) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let device = self
            .lookup_device(device_id)
            .ok_or(MixerError::UnknownDevice(device_id))?;
        let card_id = device.card().ok_or(MixerError::NoCard(device_id))?;
        let card = self
            .cards
            .get(&card_id)
            .ok_or(MixerError::UnknownCard(card_id))?;

        let best = match card.active_profile() {
            Some(current) => device.best_profile(profile, current),
            None => profile
                .map(str::to_string)
                .or_else(|| device.top_priority_profile().map(|p| p.name.clone()))
                .ok_or(MixerError::NoProfile(device_id))?,
        };

        debug!(
            "Selected {:?} on {}, moving card {} to profile '{}'",
            profile,
            device_id,
            card.name(),
            best
        );
        debug!(
            "Default sink is {:?} ({:?})",
            self.default_sink.name, self.default_sink.id
        );

        self.profile_swapping_device_id = Some(device_id);

        let card = self
            .cards
            .get_mut(&card_id)
            .ok_or(MixerError::UnknownCard(card_id))?;
        card.change_profile(self.server.as_mut(), &best)?;

        let direction = device_direction(&self.ui_outputs, device_id);
        if let Some(device) = self.devices_mut(direction).get_mut(&device_id) {
            device.set_user_preferred_profile(Some(&best));
        }
        Ok(())
    }

    /// Make `device` the active output.
    pub fn change_output(&mut self, device_id: DeviceId) -> Result<(), MixerError> {
        self.change_device(Direction::Output, device_id)
    }

    /// Make `device` the active input.
    pub fn change_input(&mut self, device_id: DeviceId) -> Result<(), MixerError> {
        self.change_device(Direction::Input, device_id)
    }

    fn change_device(&mut self, direction: Direction, device_id: DeviceId) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let device = self
            .devices(direction)
            .get(&device_id)
            .ok_or(MixerError::UnknownDevice(device_id))?;
        debug!("Changing {} to {}", direction.as_str(), device_id);

        let Some(stream) = self.stream_from_device(device) else {
            return self.change_profile_on_selected_device(device_id, None);
        };
        let stream_id = stream.id();

        if !device.has_ports() {
            debug!("Switching to portless {}", device_id);
            self.set_default(direction, stream_id)?;
            self.emit(active_update(direction, device_id));
            return Ok(());
        }

        if let Some(port) = device.port_name() {
            if stream.port() != Some(port) {
                let port = port.to_string();
                let stream = self
                    .all_streams
                    .get_mut(&stream_id)
                    .ok_or(MixerError::UnknownStream(stream_id))?;
                stream.change_port(self.server.as_mut(), &port)?;
            }
        }

        let current_default = self.default_endpoint(direction).id;
        if current_default != Some(stream_id) {
            debug!("Swapping default {} over to {}", direction.as_str(), stream_id);
            match self.set_default(direction, stream_id) {
                Ok(()) => {
                    if let Some(device) = self.lookup_device_from_stream(stream_id) {
                        self.emit(active_update(direction, device.id()));
                    }
                }
                Err(e) => {
                    warn!("Failed to change default {}: {}", direction.as_str(), e);
                    if let Some(device) = current_default.and_then(|id| self.lookup_device_from_stream(id)) {
                        self.emit(active_update(direction, device.id()));
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Ask the server to make `stream` the default sink and move restored
    /// playback routes to it.
    pub fn set_default_sink(&mut self, stream_id: StreamId) -> Result<(), MixerError> {
        self.ensure_ready()?;
        self.set_default(Direction::Output, stream_id)
    }

    /// Ask the server to make `stream` the default source and move restored
    /// capture routes to it.
    pub fn set_default_source(&mut self, stream_id: StreamId) -> Result<(), MixerError> {
        self.ensure_ready()?;
        self.set_default(Direction::Input, stream_id)
    }

    fn set_default(&mut self, direction: Direction, stream_id: StreamId) -> Result<(), MixerError> {
        let name = self
            .all_streams
            .get(&stream_id)
            .ok_or(MixerError::UnknownStream(stream_id))?
            .name()
            .to_string();

        let request = match direction {
            Direction::Output => Request::SetDefaultSink(name.clone()),
            Direction::Input => Request::SetDefaultSource(name.clone()),
        };
        if self.server.request(request).is_none() {
            warn!("Failed to set default {} to '{}'", direction.as_str(), name);
            return Err(MixerError::RequestFailed("set default"));
        }

        if self.server.request(Request::StreamRestoreRead).is_none() {
            warn!("Failed to read stream-restore entries");
            return Err(MixerError::RequestFailed("stream-restore read"));
        }
        self.restore_reads += 1;
        match direction {
            Direction::Output => self.restore_retarget_sink = Some(name),
            Direction::Input => self.restore_retarget_source = Some(name),
        }
        Ok(())
    }

    fn default_endpoint(&self, direction: Direction) -> &DefaultEndpoint {
        match direction {
            Direction::Output => &self.default_sink,
            Direction::Input => &self.default_source,
        }
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream, MixerError> {
        self.all_streams
            .get_mut(&id)
            .ok_or(MixerError::UnknownStream(id))
    }

    fn apply_user_volume(&mut self, id: StreamId, volumes: Vec<u32>) -> Result<(), MixerError> {
        let server = self.server.as_mut();
        let stream = self
            .all_streams
            .get_mut(&id)
            .ok_or(MixerError::UnknownStream(id))?;
        if stream.apply_volume(server, &volumes)? {
            self.emit(MixerEvent::StreamVolumeChanged(id));
        }
        Ok(())
    }

    /// Scale the stream so its loudest channel is at `volume`.
    pub fn set_stream_volume(&mut self, id: StreamId, volume: u32) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let volumes = self.stream_mut(id)?.channels().scaled(volume);
        self.apply_user_volume(id, volumes)
    }

    pub fn set_stream_balance(&mut self, id: StreamId, balance: f64) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let volumes = self.stream_mut(id)?.channels().with_balance(balance);
        self.apply_user_volume(id, volumes)
    }

    pub fn set_stream_fade(&mut self, id: StreamId, fade: f64) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let volumes = self.stream_mut(id)?.channels().with_fade(fade);
        self.apply_user_volume(id, volumes)
    }

    pub fn set_stream_lfe(&mut self, id: StreamId, volume: u32) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let volumes = self.stream_mut(id)?.channels().with_lfe(volume);
        self.apply_user_volume(id, volumes)
    }

    pub fn change_stream_muted(&mut self, id: StreamId, is_muted: bool) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let server = self.server.as_mut();
        let stream = self
            .all_streams
            .get_mut(&id)
            .ok_or(MixerError::UnknownStream(id))?;
        stream.change_is_muted(server, is_muted)?;
        Ok(())
    }

    pub fn change_stream_port(&mut self, id: StreamId, port: &str) -> Result<(), MixerError> {
        self.ensure_ready()?;
        let server = self.server.as_mut();
        let stream = self
            .all_streams
            .get_mut(&id)
            .ok_or(MixerError::UnknownStream(id))?;
        stream.change_port(server, port)?;
        Ok(())
    }

    /// User operations are only issued on a ready connection.
    fn ensure_ready(&self) -> Result<(), MixerError> {
        match self.state {
            MixerState::Ready => Ok(()),
            state => Err(MixerError::NotReady(state)),
        }
    }

    fn next_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        id
    }

    fn next_card_id(&mut self) -> CardId {
        let id = CardId(self.next_card_id);
        self.next_card_id += 1;
        id
    }

    fn next_device_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_device_id);
        self.next_device_id += 1;
        id
    }
}

fn device_direction(outputs: &BTreeMap<DeviceId, UIDevice>, id: DeviceId) -> Direction {
    if outputs.contains_key(&id) {
        Direction::Output
    } else {
        Direction::Input
    }
}

fn active_update(direction: Direction, id: DeviceId) -> MixerEvent {
    match direction {
        Direction::Output => MixerEvent::ActiveOutputUpdate(id),
        Direction::Input => MixerEvent::ActiveInputUpdate(id),
    }
}

fn device_added(direction: Direction, id: DeviceId) -> MixerEvent {
    match direction {
        Direction::Output => MixerEvent::OutputAdded(id),
        Direction::Input => MixerEvent::InputAdded(id),
    }
}

fn device_removed(direction: Direction, id: DeviceId) -> MixerEvent {
    match direction {
        Direction::Output => MixerEvent::OutputRemoved(id),
        Direction::Input => MixerEvent::InputRemoved(id),
    }
}

/// Report a server volume echo as a consumer event.
fn volume_event(id: StreamId, change: Option<VolumeChange>) -> Option<MixerEvent> {
    change.map(|_| MixerEvent::StreamVolumeChanged(id))
}
