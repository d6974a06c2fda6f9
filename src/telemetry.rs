//! Timestamped telemetry accumulation, grouped by request id and flushed
//! through a caller-provided sink once a turn completes.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Process-wide monotonic epoch, captured once on first use.
static TICK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic tick in microseconds since the process epoch.
pub fn current_tick() -> u64 {
    let epoch = TICK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Events recorded against the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    AudioStart,
    AudioEnd,
    AudioStreamInit,
    AudioStreamData { bytes: usize },
    AudioStreamFlush,
}

impl TelemetryEvent {
    fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::AudioStart => "audio_start",
            TelemetryEvent::AudioEnd => "audio_end",
            TelemetryEvent::AudioStreamInit => "audiostream_init",
            TelemetryEvent::AudioStreamData { .. } => "audiostream_data",
            TelemetryEvent::AudioStreamFlush => "audiostream_flush",
        }
    }
}

#[derive(Serialize)]
struct RecordedEvent {
    name: &'static str,
    tick: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
}

#[derive(Serialize)]
struct TelemetryBlock<'a> {
    request_id: &'a str,
    events: &'a [RecordedEvent],
}

/// Receives the serialized telemetry block for a finished request.
pub type TelemetrySink = Box<dyn Fn(&[u8], &str) + Send + Sync>;

/// Accumulates timestamped events per request id and counts protocol-level
/// anomalies. `flush` serializes one request's block and hands it to the
/// sink, which forwards it upstream.
pub struct TelemetryRecorder {
    sink: TelemetrySink,
    events: Mutex<HashMap<String, Vec<RecordedEvent>>>,
    unhandled_responses: AtomicU64,
}

impl TelemetryRecorder {
    pub fn new(sink: TelemetrySink) -> Self {
        Self {
            sink,
            events: Mutex::new(HashMap::new()),
            unhandled_responses: AtomicU64::new(0),
        }
    }

    /// Records an event against `request_id` at the current tick.
    pub fn record(&self, request_id: &str, event: TelemetryEvent) {
        let recorded = RecordedEvent {
            name: event.name(),
            tick: current_tick(),
            bytes: match event {
                TelemetryEvent::AudioStreamData { bytes } => Some(bytes),
                _ => None,
            },
        };
        let mut events = self.events.lock().unwrap();
        events
            .entry(request_id.to_string())
            .or_default()
            .push(recorded);
    }

    /// Counts a frame that could not be routed to any handler.
    pub fn record_unhandled_response(&self) {
        self.unhandled_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_response_count(&self) -> u64 {
        self.unhandled_responses.load(Ordering::Relaxed)
    }

    /// Serializes the accumulated block for `request_id` and invokes the
    /// sink. Flushing a request id with no events is a no-op.
    pub fn flush(&self, request_id: &str) {
        let drained = {
            let mut events = self.events.lock().unwrap();
            events.remove(request_id)
        };

        let Some(drained) = drained else {
            debug!("No telemetry recorded for request {}", request_id);
            return;
        };

        let block = TelemetryBlock {
            request_id,
            events: &drained,
        };
        match serde_json::to_vec(&block) {
            Ok(payload) => {
                debug!(
                    "Flushing {} telemetry event(s) for request {}",
                    drained.len(),
                    request_id
                );
                (self.sink)(&payload, request_id);
            }
            Err(e) => warn!("Failed to serialize telemetry block: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_ticks_are_monotonic() {
        let a = current_tick();
        let b = current_tick();
        assert!(b >= a);
    }

    #[test]
    fn test_flush_delivers_serialized_block() {
        let (tx, rx) = mpsc::channel();
        let recorder = TelemetryRecorder::new(Box::new(move |payload, request_id| {
            tx.send((payload.to_vec(), request_id.to_string())).unwrap();
        }));

        recorder.record("req-1", TelemetryEvent::AudioStreamInit);
        recorder.record("req-1", TelemetryEvent::AudioStreamData { bytes: 1280 });
        recorder.record("req-2", TelemetryEvent::AudioStart);
        recorder.flush("req-1");

        let (payload, request_id) = rx.try_recv().unwrap();
        assert_eq!(request_id, "req-1");
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["events"].as_array().unwrap().len(), 2);
        assert_eq!(value["events"][1]["bytes"], 1280);

        // req-2 events are untouched; req-1 is drained.
        recorder.flush("req-1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unhandled_counter() {
        let recorder = TelemetryRecorder::new(Box::new(|_, _| {}));
        assert_eq!(recorder.unhandled_response_count(), 0);
        recorder.record_unhandled_response();
        recorder.record_unhandled_response();
        assert_eq!(recorder.unhandled_response_count(), 2);
    }
}
