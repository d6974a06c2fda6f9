//! In-process mock speech service for integration tests and demos.
//!
//! Accepts framed connections, validates the subscription key on `Connect`,
//! and answers every completed audio turn with a scripted
//! `turn.start` → `speech.hypothesis` → `speech.phrase` → `turn.end`
//! sequence. Observed traffic is exposed for assertions.

use log::{debug, error, info, warn};
use serde_json::json;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use usp_protocol::{find_header, Connection, Frame, Header, ProtocolError, CONNECT_STATUS_OK};

const HEADER_PATH: &str = "Path";
const HEADER_CONTENT_TYPE: &str = "Content-Type";
const HEADER_REQUEST_ID: &str = "X-RequestId";
const HEADER_SUBSCRIPTION_KEY: &str = "Ocp-Apim-Subscription-Key";

/// Configuration for the mock service
#[derive(Debug, Clone)]
pub struct MockServiceConfig {
    /// Address to bind to (use "127.0.0.1:0" for a random port)
    pub bind_address: String,
    /// When set, `Connect` must carry this subscription key or is rejected
    /// with 401
    pub expected_subscription_key: Option<String>,
    /// Reject every connection with 401, regardless of credentials
    pub reject_auth: bool,
    /// Emit `speech.startDetected`/`speech.endDetected` around each turn
    pub include_detection_events: bool,
    /// Precede each turn with a deliberately malformed event (a body with
    /// no Content-Type header), which a correct client must drop
    pub send_malformed_event: bool,
    /// Message paths the service echoes back as events
    pub echo_paths: Vec<String>,
}

impl Default for MockServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            expected_subscription_key: None,
            reject_auth: false,
            include_detection_events: false,
            send_malformed_event: false,
            echo_paths: Vec::new(),
        }
    }
}

/// Everything the service has seen, for test assertions.
#[derive(Debug, Default, Clone)]
pub struct ObservedTraffic {
    pub connect_path: String,
    pub connect_headers: Vec<Header>,
    /// Request ids seen on `StreamStart` frames, in arrival order
    pub stream_request_ids: Vec<String>,
    pub audio_bytes: u64,
    /// Request ids of received telemetry blobs
    pub telemetry_request_ids: Vec<String>,
    /// `(path, body)` of discrete messages
    pub messages: Vec<(String, Vec<u8>)>,
}

/// Mock USP service bound to a local port.
pub struct MockUspService {
    config: MockServiceConfig,
    should_stop: Arc<AtomicBool>,
    observed: Arc<Mutex<ObservedTraffic>>,
    actual_port: Option<u16>,
}

impl MockUspService {
    pub fn new(config: MockServiceConfig) -> Self {
        Self {
            config,
            should_stop: Arc::new(AtomicBool::new(false)),
            observed: Arc::new(Mutex::new(ObservedTraffic::default())),
            actual_port: None,
        }
    }

    /// Starts the accept loop and returns the bound port.
    pub fn start(&mut self) -> std::io::Result<u16> {
        let listener = TcpListener::bind(&self.config.bind_address)?;
        let actual_port = listener.local_addr()?.port();
        self.actual_port = Some(actual_port);

        info!("Mock USP service listening on 127.0.0.1:{}", actual_port);

        let should_stop = self.should_stop.clone();
        let observed = self.observed.clone();
        let config = self.config.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                if should_stop.load(Ordering::Relaxed) {
                    break;
                }

                match stream {
                    Ok(stream) => {
                        let config = config.clone();
                        let observed = observed.clone();
                        let should_stop = should_stop.clone();
                        thread::spawn(move || {
                            if let Err(e) = handle_client(stream, config, observed, should_stop) {
                                debug!("Mock service client ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Mock service accept error: {}", e);
                    }
                }
            }
        });

        Ok(actual_port)
    }

    /// Starts in the background and returns a handle for tests.
    pub fn start_background(mut self) -> std::io::Result<MockServiceHandle> {
        let port = self.start()?;
        Ok(MockServiceHandle {
            port,
            should_stop: self.should_stop.clone(),
            observed: self.observed.clone(),
        })
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }

    pub fn port(&self) -> Option<u16> {
        self.actual_port
    }
}

/// Handle for a mock service running in the background
pub struct MockServiceHandle {
    pub port: u16,
    should_stop: Arc<AtomicBool>,
    observed: Arc<Mutex<ObservedTraffic>>,
}

impl MockServiceHandle {
    /// Endpoint URL ready for `UspClient::set_endpoint`.
    pub fn endpoint_url(&self) -> String {
        format!("usp://127.0.0.1:{}/speech/recognition", self.port)
    }

    /// Snapshot of everything observed so far.
    pub fn observed(&self) -> ObservedTraffic {
        self.observed.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for MockServiceHandle {
    fn drop(&mut self) {
        self.stop();
        // Give per-client threads a moment to notice
        thread::sleep(Duration::from_millis(50));
    }
}

fn handle_client(
    stream: TcpStream,
    config: MockServiceConfig,
    observed: Arc<Mutex<ObservedTraffic>>,
    should_stop: Arc<AtomicBool>,
) -> Result<(), ProtocolError> {
    let mut connection = Connection::new(stream)?;

    // Handshake: a Connect frame, answered with accept or reject.
    match connection.read_frame()? {
        Frame::Connect { path, headers } => {
            let authorized = if config.reject_auth {
                false
            } else if let Some(expected) = &config.expected_subscription_key {
                find_header(&headers, HEADER_SUBSCRIPTION_KEY) == Some(expected.as_str())
            } else {
                true
            };

            {
                let mut observed = observed.lock().unwrap();
                observed.connect_path = path;
                observed.connect_headers = headers;
            }

            if !authorized {
                warn!("Mock service rejecting connection (401)");
                connection.write_frame(&Frame::ConnectAck {
                    status: 401,
                    message: "subscription key rejected".to_string(),
                })?;
                return Ok(());
            }

            connection.write_frame(&Frame::ConnectAck {
                status: CONNECT_STATUS_OK,
                message: "connection accepted".to_string(),
            })?;
            info!("Mock service accepted a client");
        }
        frame => {
            warn!(
                "Mock service expected Connect, got {:?}; dropping client",
                frame.kind()
            );
            return Ok(());
        }
    }

    let mut current_request_id = String::new();

    loop {
        if should_stop.load(Ordering::Relaxed) {
            break;
        }

        match connection.read_frame() {
            Ok(Frame::StreamStart { path, request_id }) => {
                debug!(
                    "Mock service: stream '{}' opened for request {}",
                    path, request_id
                );
                observed
                    .lock()
                    .unwrap()
                    .stream_request_ids
                    .push(request_id.clone());
                current_request_id = request_id;
            }
            Ok(Frame::StreamChunk { body }) => {
                observed.lock().unwrap().audio_bytes += body.len() as u64;
            }
            Ok(Frame::StreamEnd) => {
                debug!(
                    "Mock service: stream ended, scripting turn {}",
                    current_request_id
                );
                send_scripted_turn(&mut connection, &config, &current_request_id)?;
            }
            Ok(Frame::Telemetry { request_id, body }) => {
                debug!(
                    "Mock service: {} bytes of telemetry for request {}",
                    body.len(),
                    request_id
                );
                observed
                    .lock()
                    .unwrap()
                    .telemetry_request_ids
                    .push(request_id);
            }
            Ok(Frame::Message { headers, body }) => {
                let path = find_header(&headers, HEADER_PATH).unwrap_or_default().to_string();
                observed
                    .lock()
                    .unwrap()
                    .messages
                    .push((path.clone(), body.clone()));
                if config.echo_paths.iter().any(|p| p == &path) {
                    connection.write_frame(&event_frame(
                        &path,
                        &current_request_id,
                        Some(body),
                    ))?;
                }
            }
            Ok(frame) => {
                warn!("Mock service ignoring {:?} frame", frame.kind());
            }
            Err(e) => {
                debug!("Mock service client disconnected: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// One event with `Path`, `X-RequestId` and, for non-empty bodies,
/// `Content-Type` headers.
fn event_frame(path: &str, request_id: &str, body: Option<Vec<u8>>) -> Frame {
    let mut headers = vec![
        (HEADER_PATH.to_string(), path.to_string()),
        (HEADER_REQUEST_ID.to_string(), request_id.to_string()),
    ];
    let body = body.unwrap_or_default();
    if !body.is_empty() {
        headers.push((
            HEADER_CONTENT_TYPE.to_string(),
            "application/json".to_string(),
        ));
    }
    Frame::Event { headers, body }
}

fn send_scripted_turn(
    connection: &mut Connection,
    config: &MockServiceConfig,
    request_id: &str,
) -> Result<(), ProtocolError> {
    if config.send_malformed_event {
        // A body without Content-Type; correct clients drop this frame.
        connection.write_frame(&Frame::Event {
            headers: vec![
                (HEADER_PATH.to_string(), "speech.hypothesis".to_string()),
                (HEADER_REQUEST_ID.to_string(), request_id.to_string()),
            ],
            body: br#"{"Text":"should never arrive"}"#.to_vec(),
        })?;
    }

    let turn_start = json!({"context": {"serviceTag": "00aa11bb22cc"}});
    connection.write_frame(&event_frame(
        "turn.start",
        request_id,
        Some(turn_start.to_string().into_bytes()),
    ))?;

    if config.include_detection_events {
        connection.write_frame(&event_frame("speech.startDetected", request_id, None))?;
    }

    let hypothesis = json!({"Text": "remind me to buy", "Offset": 1200000, "Duration": 9600000});
    connection.write_frame(&event_frame(
        "speech.hypothesis",
        request_id,
        Some(hypothesis.to_string().into_bytes()),
    ))?;

    if config.include_detection_events {
        connection.write_frame(&event_frame("speech.endDetected", request_id, None))?;
    }

    let phrase = json!({
        "RecognitionStatus": "Success",
        "DisplayText": "Remind me to buy milk.",
        "Offset": 1200000,
        "Duration": 21300000
    });
    connection.write_frame(&event_frame(
        "speech.phrase",
        request_id,
        Some(phrase.to_string().into_bytes()),
    ))?;

    connection.write_frame(&event_frame("turn.end", request_id, None))?;
    Ok(())
}
