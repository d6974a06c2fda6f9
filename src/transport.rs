//! Full-duplex message and stream channel to the speech service.
//!
//! A transport owns one framed TCP connection and one in-flight request id.
//! Sends happen on the caller's thread; a dedicated worker thread receives
//! downstream frames, enforces the `Path`/`Content-Type` header contract,
//! and hands valid events to the receive callback.

use crate::dns_cache::DnsCache;
use crate::error::UspError;
use crate::telemetry::TelemetryRecorder;
use log::{debug, error, info, warn};
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use url::Url;
use usp_protocol::{find_header, Connection, Frame, FrameWriter, Header, ProtocolError};
use uuid::Uuid;

pub const HEADER_PATH: &str = "Path";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_REQUEST_ID: &str = "X-RequestId";

pub const CONTENT_TYPE_JSON: &str = "application/json";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures observed on the wire, surfaced through the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Placeholder value; reported as a generic transport error.
    None,
    /// 401/403 from the service.
    Authentication,
    /// No route or no connection to the remote host.
    ConnectionFailure,
    /// Name resolution failed.
    DnsFailure,
    /// The peer closed the socket.
    RemoteClosed,
}

pub type ErrorHandler = Box<dyn Fn(TransportError) + Send + Sync>;
pub type RecvHandler = Box<dyn Fn(&[Header], &[u8]) + Send + Sync>;

pub struct TransportCallbacks {
    pub on_error: ErrorHandler,
    pub on_recv: RecvHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Streaming,
}

/// Framed duplex channel with request-id bookkeeping.
pub struct Transport {
    url: Url,
    headers: Vec<Header>,
    dns: Arc<DnsCache>,
    telemetry: Arc<TelemetryRecorder>,
    callbacks: Mutex<Option<Arc<TransportCallbacks>>>,
    writer: Mutex<Option<FrameWriter>>,
    socket: Mutex<Option<TcpStream>>,
    stream_state: Mutex<StreamState>,
    request_id: Mutex<String>,
    shutting_down: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Creates an unconnected transport for `url` with the given connection
    /// headers. `open` establishes the session.
    pub fn create(
        url: Url,
        headers: Vec<Header>,
        dns: Arc<DnsCache>,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Self {
        Self {
            url,
            headers,
            dns,
            telemetry,
            callbacks: Mutex::new(None),
            writer: Mutex::new(None),
            socket: Mutex::new(None),
            stream_state: Mutex::new(StreamState::Idle),
            request_id: Mutex::new(String::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Installs the error and receive callbacks. Must happen before `open`.
    pub fn set_callbacks(&self, on_error: ErrorHandler, on_recv: RecvHandler) {
        let mut callbacks = self.callbacks.lock().unwrap();
        *callbacks = Some(Arc::new(TransportCallbacks { on_error, on_recv }));
    }

    fn report_error(&self, reason: TransportError) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        match callbacks {
            Some(cb) => (cb.on_error)(reason),
            None => info!("No callback is defined for transport errors."),
        }
    }

    /// Resolves, connects, performs the `Connect`/`ConnectAck` handshake and
    /// starts the receive worker. Failures are also reported through the
    /// error callback.
    pub fn open(&self) -> Result<(), TransportError> {
        let callbacks = match self.callbacks.lock().unwrap().clone() {
            Some(cb) => cb,
            None => {
                error!("Transport callbacks must be installed before open.");
                return Err(TransportError::None);
            }
        };

        let reader = match self.open_connection() {
            Ok(reader) => reader,
            Err(reason) => {
                self.report_error(reason);
                return Err(reason);
            }
        };

        // First turn's request id
        self.create_request_id();

        let shutting_down = self.shutting_down.clone();
        let telemetry = self.telemetry.clone();
        let worker = thread::spawn(move || {
            receive_loop(reader, callbacks, telemetry, shutting_down);
        });
        *self.worker.lock().unwrap() = Some(worker);

        info!("Transport connected to {}", self.url);
        Ok(())
    }

    fn open_connection(&self) -> Result<usp_protocol::FrameReader, TransportError> {
        let host = self.url.host_str().ok_or(TransportError::ConnectionFailure)?;
        let port = self.url.port().ok_or(TransportError::ConnectionFailure)?;

        let addrs = self.dns.resolve(host, port).map_err(|e| {
            warn!("DNS resolution for {} failed: {}", host, e);
            TransportError::DnsFailure
        })?;

        let stream = TcpStream::connect(&addrs[..]).map_err(|e| {
            warn!("Connection to {}:{} failed: {}", host, port, e);
            TransportError::ConnectionFailure
        })?;

        let mut connection =
            Connection::new(stream.try_clone().map_err(|_| TransportError::ConnectionFailure)?)
                .map_err(|_| TransportError::ConnectionFailure)?;

        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }

        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(|_| TransportError::ConnectionFailure)?;

        connection
            .write_frame(&Frame::Connect {
                path,
                headers: self.headers.clone(),
            })
            .map_err(|_| TransportError::ConnectionFailure)?;

        match connection.read_frame() {
            Ok(Frame::ConnectAck { status, message }) if status == usp_protocol::CONNECT_STATUS_OK => {
                debug!("Connection accepted: {}", message);
            }
            Ok(Frame::ConnectAck { status, message }) if status == 401 || status == 403 => {
                warn!("Connection rejected with status {}: {}", status, message);
                return Err(TransportError::Authentication);
            }
            Ok(Frame::ConnectAck { status, message }) => {
                warn!("Connection rejected with status {}: {}", status, message);
                return Err(TransportError::ConnectionFailure);
            }
            Ok(frame) => {
                warn!("Unexpected {:?} frame during handshake", frame.kind());
                return Err(TransportError::ConnectionFailure);
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                return Err(TransportError::ConnectionFailure);
            }
        }

        // The worker blocks indefinitely; the handshake deadline no longer
        // applies.
        stream
            .set_read_timeout(None)
            .map_err(|_| TransportError::ConnectionFailure)?;

        let (reader, writer) = connection.split();
        *self.writer.lock().unwrap() = Some(writer);
        *self.socket.lock().unwrap() = Some(stream);
        Ok(reader)
    }

    fn write_frame(&self, frame: &Frame) -> crate::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let writer = writer
            .as_mut()
            .ok_or_else(|| UspError::TransportGeneric("transport is not connected".to_string()))?;
        writer
            .write_frame(frame)
            .map_err(|e| UspError::TransportGeneric(e.to_string()))
    }

    /// Sends a discrete message tagged with `path` on the current request.
    pub fn message_write(&self, path: &str, body: &[u8]) -> crate::Result<()> {
        let mut headers = vec![
            (HEADER_PATH.to_string(), path.to_string()),
            (HEADER_REQUEST_ID.to_string(), self.request_id()),
        ];
        if !body.is_empty() {
            headers.push((HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string()));
        }
        self.write_frame(&Frame::Message {
            headers,
            body: body.to_vec(),
        })
    }

    /// Opens the streamed body for the current request. One stream at a
    /// time.
    pub fn stream_prepare(&self, path: &str) -> crate::Result<()> {
        let mut state = self.stream_state.lock().unwrap();
        if *state == StreamState::Streaming {
            return Err(UspError::TransportGeneric(
                "a stream is already open on this request".to_string(),
            ));
        }
        self.write_frame(&Frame::StreamStart {
            path: path.to_string(),
            request_id: self.request_id(),
        })?;
        *state = StreamState::Streaming;
        Ok(())
    }

    /// Appends bytes to the open stream.
    pub fn stream_write(&self, body: &[u8]) -> crate::Result<()> {
        let state = self.stream_state.lock().unwrap();
        if *state != StreamState::Streaming {
            return Err(UspError::TransportGeneric(
                "no stream is open on this request".to_string(),
            ));
        }
        self.write_frame(&Frame::StreamChunk {
            body: body.to_vec(),
        })
    }

    /// Signals end-of-audio for the current turn.
    pub fn stream_flush(&self) -> crate::Result<()> {
        let mut state = self.stream_state.lock().unwrap();
        if *state != StreamState::Streaming {
            return Err(UspError::TransportGeneric(
                "no stream is open on this request".to_string(),
            ));
        }
        self.write_frame(&Frame::StreamEnd)?;
        *state = StreamState::Idle;
        Ok(())
    }

    /// Sends a telemetry blob for `request_id`.
    pub fn write_telemetry(&self, body: &[u8], request_id: &str) -> crate::Result<()> {
        self.write_frame(&Frame::Telemetry {
            request_id: request_id.to_string(),
            body: body.to_vec(),
        })
    }

    /// Allocates and installs a fresh turn identifier.
    pub fn create_request_id(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let mut request_id = self.request_id.lock().unwrap();
        debug!("New request id {}", id);
        *request_id = id.clone();
        id
    }

    /// The current in-flight turn identifier.
    pub fn request_id(&self) -> String {
        self.request_id.lock().unwrap().clone()
    }

    /// Closes the connection and joins the receive worker. Idempotent; any
    /// in-flight stream is cancelled.
    pub fn destroy(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = self.socket.lock().unwrap().take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        *self.writer.lock().unwrap() = None;
        *self.stream_state.lock().unwrap() = StreamState::Idle;
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        info!("Transport to {} destroyed", self.url);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn map_io_error(e: &io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => TransportError::RemoteClosed,
        _ => TransportError::ConnectionFailure,
    }
}

/// Receive worker: validates the header contract on every downstream frame
/// and forwards valid events. Exits on the first wire error.
fn receive_loop(
    mut reader: usp_protocol::FrameReader,
    callbacks: Arc<TransportCallbacks>,
    telemetry: Arc<TelemetryRecorder>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        match reader.read_frame() {
            Ok(Frame::Event { headers, body }) => {
                let path = match find_header(&headers, HEADER_PATH) {
                    Some(path) => path,
                    None => {
                        warn!("Protocol violation: response missing '{}' header", HEADER_PATH);
                        telemetry.record_unhandled_response();
                        continue;
                    }
                };
                if !body.is_empty() && find_header(&headers, HEADER_CONTENT_TYPE).is_none() {
                    warn!(
                        "Protocol violation: response '{}' contains body with no content-type",
                        path
                    );
                    telemetry.record_unhandled_response();
                    continue;
                }
                (callbacks.on_recv)(&headers, &body);
            }
            Ok(frame) => {
                warn!("Dropping unexpected {:?} frame from service", frame.kind());
            }
            Err(ProtocolError::Io(e)) => {
                if !shutting_down.load(Ordering::SeqCst) {
                    debug!("Receive worker stopping: {}", e);
                    (callbacks.on_error)(map_io_error(&e));
                }
                break;
            }
            Err(e) => {
                error!("Undecodable frame from service: {}", e);
                if !shutting_down.load(Ordering::SeqCst) {
                    (callbacks.on_error)(TransportError::None);
                }
                break;
            }
        }
    }
    debug!("Receive worker exited");
}
