//! Pump thread feeding captured audio from a blocking ring buffer into a
//! connected client.

use crate::client::UspClient;
use crate::error::UspError;
use crate::ring_buffer::{BlockingRingBuffer, RingBufferError};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Drains a [`BlockingRingBuffer`] into [`UspClient::audio_write`] in fixed
/// chunks. The producer ends the stream with `unblock()` (or `term()`); the
/// pump then forwards the remaining bytes, flushes the audio turn, and
/// exits.
pub struct AudioPump {
    worker: Option<JoinHandle<()>>,
}

impl AudioPump {
    pub fn start(
        buffer: Arc<BlockingRingBuffer>,
        client: Arc<UspClient>,
        chunk_size: usize,
    ) -> Result<Self, UspError> {
        if chunk_size == 0 {
            return Err(UspError::InvalidArgument(
                "chunk size must be non-zero".to_string(),
            ));
        }

        let worker = thread::spawn(move || pump_loop(buffer, client, chunk_size));
        Ok(Self {
            worker: Some(worker),
        })
    }

    /// Waits for the pump to finish its final flush and exit.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn pump_loop(buffer: Arc<BlockingRingBuffer>, client: Arc<UspClient>, chunk_size: usize) {
    let mut total = 0u64;
    loop {
        match buffer.read_shared_some(chunk_size) {
            Ok(chunk) if chunk.len() == chunk_size => {
                if let Err(e) = client.audio_write(&chunk) {
                    warn!("Audio pump stopping, write failed: {}", e);
                    return;
                }
                total += chunk.len() as u64;
            }
            Ok(chunk) => {
                // Unblock pulse: forward the tail, then end the turn.
                if !chunk.is_empty() {
                    if let Err(e) = client.audio_write(&chunk) {
                        warn!("Audio pump stopping, final write failed: {}", e);
                        return;
                    }
                    total += chunk.len() as u64;
                }
                break;
            }
            Err(RingBufferError::Terminated) => {
                debug!("Audio pump source terminated");
                break;
            }
            Err(e) => {
                warn!("Audio pump stopping, read failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = client.audio_flush() {
        warn!("Audio pump flush failed: {}", e);
    }
    info!("Audio pump finished after {} bytes", total);
}
