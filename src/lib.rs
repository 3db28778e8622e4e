// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! mixctl - sound device abstraction for Linux sound servers.
//!
//! Turns the flat, asynchronously updated sinks, sources, cards and ports of
//! a sound server into stable input and output devices a volume panel can
//! list and switch between.

pub mod card;
pub mod channel_volume;
pub mod control;
pub mod profile;
pub mod server;
pub mod stream;
pub mod ui_device;

pub use card::{Card, CardError, CardId, CardPort, CardProfile};
pub use channel_volume::{ChannelPosition, ChannelVolume, VOLUME_MUTED, VOLUME_NORM};
pub use control::{ControlOptions, MixerControl, MixerError, MixerEvent, MixerState};
pub use server::{ServerError, ServerEvent, SoundServer};
pub use stream::{Stream, StreamError, StreamId, StreamKind};
pub use ui_device::{DeviceId, Direction, UIDevice};
