//! Client core for a cloud speech-recognition service.
//!
//! Two subsystems carry the load: the USP client, a long-lived duplex
//! connection that streams audio up and receives recognition events down,
//! and the positioned ring buffers backing the audio capture pipeline that
//! feeds it.
//!
//! ```text
//! producer → BlockingRingBuffer → AudioPump → UspClient → service
//! service  → Transport worker → dispatch → user callbacks
//! ```

pub mod audio_pump;
pub mod client;
pub mod config;
pub mod dns_cache;
pub mod error;
pub mod mock_service;
pub mod ring_buffer;
pub mod telemetry;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio_pump::AudioPump;
pub use client::{
    Authentication, ConnectionState, EndpointKind, OutputFormat, RecognitionStatus,
    SpeechFragment, SpeechHypothesis, SpeechPhrase, TurnEnd, TurnStart, UspCallbacks, UspClient,
};
pub use config::ClientConfig;
pub use dns_cache::DnsCache;
pub use error::{Result, UspError};
pub use ring_buffer::{BlockingRingBuffer, RingBuffer, RingBufferError};
pub use telemetry::{TelemetryEvent, TelemetryRecorder};
pub use transport::{Transport, TransportError};
