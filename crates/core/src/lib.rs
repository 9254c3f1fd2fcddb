//! Core library for Beatcue.
//!
//! Beatcue follows a live DJ performance through a [`Source`] that only
//! exposes beat counters, tempo and track metadata, interpolates a continuous
//! beat position with [`BeatClock`], and fires pre-authored cues from
//! per-song timelines ([`CueSheet`]) exactly once as the performance reaches
//! them. Fired cues leave through a [`Sink`] as one OSC bundle per tick.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod library;
pub mod offsets;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod timeline;

pub use clock::{BeatClock, BeatEvent, BeatPosition, BeatSample, Deck, DeckSample, TrackIdentity};
pub use config::{AppConfig, EngineConfig, OscConfig, SimulatorConfig};
pub use engine::{Command, Engine, TickReport};
pub use error::{BeatCueError, Result};
pub use library::CueLibrary;
pub use offsets::{MemoryLayout, OffsetDatabase, PointerChain};
pub use scheduler::CueScheduler;
pub use sink::{NullSink, OutboundBatch, Sink, UdpSink};
pub use source::{MemoryReader, PointerSource, ScriptedSource, SimulatedSource, Source, StaleTolerant};
pub use timeline::{CueEvent, CueInstant, CueSheet, CueValue, ValueKind};
