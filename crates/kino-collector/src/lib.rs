//! Kino Collector - Playback Analytics for Kino
//!
//! This crate turns player lifecycle callbacks into telemetry samples:
//! - Playback state machine with heartbeat and timeout timers
//! - Sample model and manipulator pipeline
//! - Dispatch pipeline gated on license authorization
//! - Queued HTTP backend with optional resend-on-failure
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Kino Collector                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  player adapter ──transition()──┐                               │
//! │                                 ▼                               │
//! │  ┌──────────────┐        ┌──────────────┐                       │
//! │  │    Timer     │───────▶│    State     │                       │
//! │  │   Service    │        │   Machine    │                       │
//! │  └──────────────┘        └──────┬───────┘                       │
//! │                                 │ listener events               │
//! │                          ┌──────┴───────┐  ┌──────────────┐     │
//! │                          │  Collector   │◀─│ Manipulators │     │
//! │                          │   (Sample)   │  └──────────────┘     │
//! │                          └──────┬───────┘                       │
//! │                                 │ add()                         │
//! │  ┌──────────────┐        ┌──────┴───────┐                       │
//! │  │   License    │───────▶│    Sample    │                       │
//! │  │   Provider   │        │  Dispatcher  │                       │
//! │  └──────────────┘        └──────┬───────┘                       │
//! │                                 │ send()                        │
//! │                   ┌─────────────┴─────────────┐                 │
//! │                   │ RetryBackend (opt-in)     │                 │
//! │                   │   └─ QueuedBackend ─ HTTP │                 │
//! │                   └───────────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod license;
pub mod manipulator;
pub mod sample;
pub mod state;
pub mod testing;
pub mod timer;
pub mod types;

pub use backend::{
    create_backend, create_backend_with_transport, Backend, CallbackBackend, HttpTransport,
    Payload, QueuedBackend, RetryBackend, RetryPolicy, SampleTransport,
};
pub use collector::Collector;
pub use config::{CollectorConfig, RetryConfig};
pub use dispatch::{DispatchState, SampleDispatcher};
pub use error::{Error, Result};
pub use license::{AuthorizationResult, HttpLicenseProvider, LicenseProvider, StaticLicenseProvider};
pub use manipulator::{
    DeviceInfo, DeviceInfoManipulator, ManipulatorPipeline, PlaybackInfo, PlaybackInfoManipulator,
    PlaybackInfoSource, SampleManipulator,
};
pub use sample::{AdSample, Sample};
pub use state::{ActiveTimers, PositionSource, StateMachine, StateMachineListener, StateSnapshot, TimeoutKind};
pub use timer::{Timer, TimerService};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the collector version; call once at startup
pub fn init() {
    tracing::info!(version = VERSION, "Kino Collector initialized");
}
