// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The PulseAudio mainloop thread.
//!
//! One thread per connection attempt. It owns the libpulse mainloop and
//! context (neither is `Send`), executes [`Request`]s received over a
//! channel and reports every callback back as a [`ServerEvent`].

use super::{convert, PulseError};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::subscribe::InterestMaskSet;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as PaState};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::{Operation, State as OperationState};
use libpulse_binding::proplist::{properties, Proplist, UpdateMode};
use mixctl::server::{ContextState, EndpointKind, ListKind, OperationId, Request, ServerEvent};
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const ITERATE_INTERVAL: Duration = Duration::from_millis(5);

/// Commands sent from [`super::PulseServer`] to the mainloop thread.
pub(super) enum PulseCommand {
    Request { id: OperationId, request: Request },
    Cancel(OperationId),
    Shutdown,
}

/// Connection parameters of one mainloop thread.
#[derive(Debug, Clone)]
pub(super) struct ThreadSettings {
    pub server: Option<String>,
    pub client_name: String,
    pub generation: u64,
}

/// Sends events tagged with the connection they belong to.
#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<(u64, ServerEvent)>,
    generation: u64,
}

impl EventSink {
    fn send(&self, event: ServerEvent) {
        if self.tx.send((self.generation, event)).is_err() {
            trace!("Event receiver is gone");
        }
    }

    fn completion(&self, id: OperationId) -> impl FnMut(bool) + 'static {
        let events = self.clone();
        move |success| events.send(ServerEvent::OperationComplete { id, success })
    }

    /// Forward one list callback, closing the list with an end marker.
    fn list<T>(&self, kind: ListKind, result: ListResult<T>, convert: impl FnOnce(T) -> ServerEvent) {
        match result {
            ListResult::Item(item) => self.send(convert(item)),
            ListResult::End => self.send(ServerEvent::ListEnd { kind, success: true }),
            ListResult::Error => self.send(ServerEvent::ListEnd { kind, success: false }),
        }
    }

    /// Forward a single-object lookup. Missing objects were removed meanwhile.
    fn item<T>(&self, kind: ListKind, result: ListResult<T>, convert: impl FnOnce(T) -> ServerEvent) {
        match result {
            ListResult::Item(item) => self.send(convert(item)),
            ListResult::End => {}
            ListResult::Error => debug!("Lookup in {:?} failed", kind),
        }
    }
}

/// Operations that can still be canceled.
trait PendingOperation {
    fn cancel(&mut self);
    fn is_running(&self) -> bool;
}

impl<T: ?Sized> PendingOperation for Operation<T> {
    fn cancel(&mut self) {
        Operation::cancel(self);
    }

    fn is_running(&self) -> bool {
        self.get_state() == OperationState::Running
    }
}

/// Handle to the mainloop thread.
pub(super) struct PulseThread {
    cmd_tx: mpsc::Sender<PulseCommand>,
    handle: Option<JoinHandle<()>>,
}

impl PulseThread {
    pub fn spawn(
        settings: ThreadSettings,
        event_tx: mpsc::Sender<(u64, ServerEvent)>,
    ) -> Result<Self, PulseError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let events = EventSink {
            tx: event_tx,
            generation: settings.generation,
        };

        let handle = thread::Builder::new()
            .name(format!("pulse-{}", settings.generation))
            .spawn(move || {
                if let Err(e) = run_pulse_loop(&settings, cmd_rx, &events) {
                    error!("PulseAudio thread error: {}", e);
                    events.send(ServerEvent::ContextState(ContextState::Failed));
                }
            })
            .map_err(|e| PulseError::Thread(e.to_string()))?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: PulseCommand) -> Result<(), PulseError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| PulseError::Thread("Channel closed".to_string()))
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(PulseCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PulseThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pulse_loop(
    settings: &ThreadSettings,
    cmd_rx: mpsc::Receiver<PulseCommand>,
    events: &EventSink,
) -> Result<(), PulseError> {
    let mut mainloop = Mainloop::new().ok_or(PulseError::Init("mainloop"))?;

    let mut proplist = Proplist::new().ok_or(PulseError::Init("proplist"))?;
    proplist
        .set_str(properties::APPLICATION_NAME, &settings.client_name)
        .ok();
    proplist
        .set_str(properties::APPLICATION_ID, mixctl_ipc::DBUS_NAME)
        .ok();
    proplist
        .set_str(properties::APPLICATION_ICON_NAME, "multimedia-volume-control")
        .ok();

    let mut context = Context::new_with_proplist(&mainloop, &settings.client_name, &proplist)
        .ok_or(PulseError::Init("context"))?;

    context
        .connect(settings.server.as_deref(), ContextFlagSet::NOFLAGS, None)
        .map_err(|e| PulseError::Connect(ToString::to_string(&e)))?;
    debug!(
        "PulseAudio context {} connecting to {}",
        settings.generation,
        settings.server.as_deref().unwrap_or("default server")
    );

    let mut pending: HashMap<OperationId, Box<dyn PendingOperation>> = HashMap::new();
    let mut last_state: Option<PaState> = None;

    loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(PulseCommand::Request { id, request }) => {
                    trace!("Executing {} {:?}", id, request);
                    if let Some(op) = execute(&mut context, events, id, request) {
                        pending.insert(id, op);
                    }
                }
                Ok(PulseCommand::Cancel(id)) => {
                    if let Some(mut op) = pending.remove(&id) {
                        trace!("Canceling {}", id);
                        op.cancel();
                    }
                }
                Ok(PulseCommand::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                    info!("PulseAudio context {} shutting down", settings.generation);
                    context.disconnect();
                    return Ok(());
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        match mainloop.iterate(false) {
            IterateResult::Success(_) => {}
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                warn!("PulseAudio mainloop stopped");
                events.send(ServerEvent::ContextState(ContextState::Failed));
                return Ok(());
            }
        }

        let state = context.get_state();
        if last_state != Some(state) {
            last_state = Some(state);
            debug!("PulseAudio context {}: {:?}", settings.generation, state);
            events.send(ServerEvent::ContextState(convert::context_state(state)));
            if matches!(state, PaState::Failed | PaState::Terminated) {
                return Ok(());
            }
        }

        pending.retain(|_, op| op.is_running());
        thread::sleep(ITERATE_INTERVAL);
    }
}

/// Only a ready context hands out operations; anything else yields a null one.
fn accepts_requests(state: PaState) -> bool {
    state == PaState::Ready
}

/// Issue one request on the context. Returns the cancelable operation.
fn execute(
    context: &mut Context,
    events: &EventSink,
    id: OperationId,
    request: Request,
) -> Option<Box<dyn PendingOperation>> {
    let state = context.get_state();
    if !accepts_requests(state) {
        warn!("Context is {:?}, dropping {} {:?}", state, id, request);
        events.send(ServerEvent::OperationComplete { id, success: false });
        return None;
    }

    let introspect = context.introspect();
    let ev = events.clone();

    let op: Box<dyn PendingOperation> = match request {
        Request::ServerInfo => Box::new(introspect.get_server_info(move |info| {
            ev.send(ServerEvent::ServerInfo(convert::server(info)));
        })),
        Request::Cards(None) => Box::new(introspect.get_card_info_list(move |r| {
            ev.list(ListKind::Cards, r, |i| ServerEvent::Card(convert::card(i)));
        })),
        Request::Cards(Some(index)) => Box::new(introspect.get_card_info_by_index(index, move |r| {
            ev.item(ListKind::Cards, r, |i| ServerEvent::Card(convert::card(i)));
        })),
        Request::Clients(None) => Box::new(introspect.get_client_info_list(move |r| {
            ev.list(ListKind::Clients, r, |i| ServerEvent::Client(convert::client(i)));
        })),
        Request::Clients(Some(index)) => Box::new(introspect.get_client_info(index, move |r| {
            ev.item(ListKind::Clients, r, |i| ServerEvent::Client(convert::client(i)));
        })),
        Request::Sinks(None) => Box::new(introspect.get_sink_info_list(move |r| {
            ev.list(ListKind::Sinks, r, |i| ServerEvent::Sink(convert::sink(i)));
        })),
        Request::Sinks(Some(index)) => Box::new(introspect.get_sink_info_by_index(index, move |r| {
            ev.item(ListKind::Sinks, r, |i| ServerEvent::Sink(convert::sink(i)));
        })),
        Request::Sources(None) => Box::new(introspect.get_source_info_list(move |r| {
            ev.list(ListKind::Sources, r, |i| ServerEvent::Source(convert::source(i)));
        })),
        Request::Sources(Some(index)) => Box::new(introspect.get_source_info_by_index(index, move |r| {
            ev.item(ListKind::Sources, r, |i| ServerEvent::Source(convert::source(i)));
        })),
        Request::SinkInputs(None) => Box::new(introspect.get_sink_input_info_list(move |r| {
            ev.list(ListKind::SinkInputs, r, |i| ServerEvent::SinkInput(convert::sink_input(i)));
        })),
        Request::SinkInputs(Some(index)) => Box::new(introspect.get_sink_input_info(index, move |r| {
            ev.item(ListKind::SinkInputs, r, |i| ServerEvent::SinkInput(convert::sink_input(i)));
        })),
        Request::SourceOutputs(None) => Box::new(introspect.get_source_output_info_list(move |r| {
            ev.list(ListKind::SourceOutputs, r, |i| {
                ServerEvent::SourceOutput(convert::source_output(i))
            });
        })),
        Request::SourceOutputs(Some(index)) => {
            Box::new(introspect.get_source_output_info(index, move |r| {
                ev.item(ListKind::SourceOutputs, r, |i| {
                    ServerEvent::SourceOutput(convert::source_output(i))
                });
            }))
        }
        Request::StreamRestoreRead => Box::new(context.stream_restore().read(move |r| {
            match r {
                ListResult::Item(info) => match convert::restore_entry(info) {
                    Some(entry) => ev.send(ServerEvent::StreamRestore(entry)),
                    None => trace!("Skipping unnamed stream-restore entry"),
                },
                ListResult::End => ev.send(ServerEvent::ListEnd {
                    kind: ListKind::StreamRestore,
                    success: true,
                }),
                ListResult::Error => ev.send(ServerEvent::ListEnd {
                    kind: ListKind::StreamRestore,
                    success: false,
                }),
            }
        })),
        Request::StreamRestoreWrite(entry) => {
            let info = convert::restore_info(&entry);
            Box::new(context.stream_restore().write(
                UpdateMode::Replace,
                &[&info],
                true,
                events.completion(id),
            ))
        }
        Request::Subscribe => {
            let ev = events.clone();
            context.set_subscribe_callback(Some(Box::new(move |facility, operation, index| {
                let (Some(facility), Some(operation)) = (facility.and_then(convert::facility), operation)
                else {
                    return;
                };
                ev.send(ServerEvent::Subscription {
                    facility,
                    change: convert::subscription_change(operation),
                    index,
                });
            })));
            let mask = InterestMaskSet::SINK
                | InterestMaskSet::SOURCE
                | InterestMaskSet::SINK_INPUT
                | InterestMaskSet::SOURCE_OUTPUT
                | InterestMaskSet::CLIENT
                | InterestMaskSet::SERVER
                | InterestMaskSet::CARD;
            Box::new(context.subscribe(mask, events.completion(id)))
        }
        Request::SetVolume { kind, index, volume } => {
            let mut introspect = introspect;
            let cv = convert::channel_volumes(&volume);
            let done = Some(Box::new(events.completion(id)) as Box<dyn FnMut(bool)>);
            Box::new(match kind {
                EndpointKind::Sink => introspect.set_sink_volume_by_index(index, &cv, done),
                EndpointKind::Source => introspect.set_source_volume_by_index(index, &cv, done),
                EndpointKind::SinkInput => introspect.set_sink_input_volume(index, &cv, done),
                EndpointKind::SourceOutput => introspect.set_source_output_volume(index, &cv, done),
            })
        }
        Request::SetMute { kind, index, mute } => {
            let mut introspect = introspect;
            let done = Some(Box::new(events.completion(id)) as Box<dyn FnMut(bool)>);
            Box::new(match kind {
                EndpointKind::Sink => introspect.set_sink_mute_by_index(index, mute, done),
                EndpointKind::Source => introspect.set_source_mute_by_index(index, mute, done),
                EndpointKind::SinkInput => introspect.set_sink_input_mute(index, mute, done),
                EndpointKind::SourceOutput => introspect.set_source_output_mute(index, mute, done),
            })
        }
        Request::SetPort { kind, index, port } => {
            let mut introspect = introspect;
            let done = Some(Box::new(events.completion(id)) as Box<dyn FnMut(bool)>);
            match kind {
                EndpointKind::Sink => Box::new(introspect.set_sink_port_by_index(index, &port, done)),
                EndpointKind::Source => {
                    Box::new(introspect.set_source_port_by_index(index, &port, done))
                }
                EndpointKind::SinkInput | EndpointKind::SourceOutput => {
                    warn!("{:?} {} has no ports", kind, index);
                    events.send(ServerEvent::OperationComplete { id, success: false });
                    return None;
                }
            }
        }
        Request::SetCardProfile { index, profile } => {
            let mut introspect = introspect;
            let done = Some(Box::new(events.completion(id)) as Box<dyn FnMut(bool)>);
            Box::new(introspect.set_card_profile_by_index(index, &profile, done))
        }
        Request::SetDefaultSink(name) => Box::new(context.set_default_sink(&name, events.completion(id))),
        Request::SetDefaultSource(name) => {
            Box::new(context.set_default_source(&name, events.completion(id)))
        }
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ready_context_accepts_requests() {
        assert!(accepts_requests(PaState::Ready));
        for state in [
            PaState::Unconnected,
            PaState::Connecting,
            PaState::Authorizing,
            PaState::SettingName,
            PaState::Failed,
            PaState::Terminated,
        ] {
            assert!(!accepts_requests(state), "{:?}", state);
        }
    }

    #[test]
    fn test_completion_is_tagged_with_generation() {
        let (tx, rx) = mpsc::channel();
        let sink = EventSink { tx, generation: 7 };
        let mut complete = sink.completion(3);
        complete(false);
        let (generation, event) = rx.try_recv().unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(
            event,
            ServerEvent::OperationComplete { id: 3, success: false }
        ));
    }
}
