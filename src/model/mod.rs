//! Read-model snapshots consumed by the engine.
//!
//! Nothing in this module performs I/O. The engine receives these types by value
//! from the external persistence layer (out of scope here, see `SPEC_FULL.md` §1)
//! and never mutates them — it only emits events (`StreamState`, `PlaybackPosition`,
//! `RelayState`) describing what it is doing with them.

mod camera;
mod cue;
mod destination;
mod stream;
mod timeline;

pub use camera::{Camera, CameraKind, Preset};
pub use cue::{Coordinate, Cue, CueAction, Track, TrackKind};
pub use destination::{ControlPlaneConfig, Destination, WatchdogConfig};
pub use stream::{PlaybackPosition, RelayState, StreamState, StreamStatus};
pub use timeline::{Asset, AssetKind, Timeline};
