use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use thiserror::Error;

/// Maximum payload size accepted for a single frame (16MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// `ConnectAck` status for an accepted connection.
pub const CONNECT_STATUS_OK: u16 = 200;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame kind: {0:#04x}")]
    InvalidFrameKind(u8),

    #[error("Invalid payload size: {0}")]
    InvalidPayloadSize(u32),

    #[error("Invalid string encoding")]
    InvalidString,
}

/// Frame kinds for the binary protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    // Client → Server
    Connect = 0x01,
    Message = 0x02,
    StreamStart = 0x03,
    StreamChunk = 0x04,
    StreamEnd = 0x05,
    Telemetry = 0x06,

    // Server → Client
    ConnectAck = 0x10,
    Event = 0x11,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(FrameKind::Connect),
            0x02 => Ok(FrameKind::Message),
            0x03 => Ok(FrameKind::StreamStart),
            0x04 => Ok(FrameKind::StreamChunk),
            0x05 => Ok(FrameKind::StreamEnd),
            0x06 => Ok(FrameKind::Telemetry),
            0x10 => Ok(FrameKind::ConnectAck),
            0x11 => Ok(FrameKind::Event),
            _ => Err(ProtocolError::InvalidFrameKind(value)),
        }
    }
}

/// A single `(name, value)` header pair carried by a frame.
pub type Header = (String, String);

/// Frames that can be sent or received
#[derive(Debug, Clone)]
pub enum Frame {
    // Client → Server
    /// Opens a session: the request path (with query) plus connection headers.
    Connect {
        path: String,
        headers: Vec<Header>,
    },
    /// A discrete path-tagged message.
    Message {
        headers: Vec<Header>,
        body: Vec<u8>,
    },
    /// Opens a streamed body on the current request.
    StreamStart {
        path: String,
        request_id: String,
    },
    /// A chunk of the open stream.
    StreamChunk {
        body: Vec<u8>,
    },
    /// Ends the open stream.
    StreamEnd,
    /// A telemetry blob for a finished request.
    Telemetry {
        request_id: String,
        body: Vec<u8>,
    },

    // Server → Client
    /// Accepts or rejects a `Connect`. Status uses HTTP semantics
    /// (200 accepted, 401/403 auth rejected).
    ConnectAck {
        status: u16,
        message: String,
    },
    /// A path-tagged downstream event.
    Event {
        headers: Vec<Header>,
        body: Vec<u8>,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Connect { .. } => FrameKind::Connect,
            Frame::Message { .. } => FrameKind::Message,
            Frame::StreamStart { .. } => FrameKind::StreamStart,
            Frame::StreamChunk { .. } => FrameKind::StreamChunk,
            Frame::StreamEnd => FrameKind::StreamEnd,
            Frame::Telemetry { .. } => FrameKind::Telemetry,
            Frame::ConnectAck { .. } => FrameKind::ConnectAck,
            Frame::Event { .. } => FrameKind::Event,
        }
    }

    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::new();

        match self {
            Frame::Connect { path, headers } => {
                write_string(&mut payload, path);
                write_headers(&mut payload, headers);
            }
            Frame::Message { headers, body } => {
                write_headers(&mut payload, headers);
                write_bytes(&mut payload, body);
            }
            Frame::StreamStart { path, request_id } => {
                write_string(&mut payload, path);
                write_string(&mut payload, request_id);
            }
            Frame::StreamChunk { body } => {
                write_bytes(&mut payload, body);
            }
            Frame::StreamEnd => {
                // No payload
            }
            Frame::Telemetry { request_id, body } => {
                write_string(&mut payload, request_id);
                write_bytes(&mut payload, body);
            }
            Frame::ConnectAck { status, message } => {
                payload.extend_from_slice(&status.to_le_bytes());
                write_string(&mut payload, message);
            }
            Frame::Event { headers, body } => {
                write_headers(&mut payload, headers);
                write_bytes(&mut payload, body);
            }
        }

        // Final layout: [kind:u8][length:u32][payload...]
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(self.kind() as u8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        Ok(frame)
    }

    /// Deserialize frame from a payload of the given kind
    pub fn from_bytes(kind: FrameKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = payload;

        match kind {
            FrameKind::Connect => {
                let path = read_string(&mut reader)?;
                let headers = read_headers(&mut reader)?;
                Ok(Frame::Connect { path, headers })
            }
            FrameKind::Message => {
                let headers = read_headers(&mut reader)?;
                let body = read_bytes(&mut reader)?;
                Ok(Frame::Message { headers, body })
            }
            FrameKind::StreamStart => {
                let path = read_string(&mut reader)?;
                let request_id = read_string(&mut reader)?;
                Ok(Frame::StreamStart { path, request_id })
            }
            FrameKind::StreamChunk => {
                let body = read_bytes(&mut reader)?;
                Ok(Frame::StreamChunk { body })
            }
            FrameKind::StreamEnd => Ok(Frame::StreamEnd),
            FrameKind::Telemetry => {
                let request_id = read_string(&mut reader)?;
                let body = read_bytes(&mut reader)?;
                Ok(Frame::Telemetry { request_id, body })
            }
            FrameKind::ConnectAck => {
                if reader.len() < 2 {
                    return Err(ProtocolError::InvalidPayloadSize(reader.len() as u32));
                }
                let status = u16::from_le_bytes([reader[0], reader[1]]);
                reader = &reader[2..];
                let message = read_string(&mut reader)?;
                Ok(Frame::ConnectAck { status, message })
            }
            FrameKind::Event => {
                let headers = read_headers(&mut reader)?;
                let body = read_bytes(&mut reader)?;
                Ok(Frame::Event { headers, body })
            }
        }
    }
}

/// Finds a header value by case-sensitive name.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, v)| v.as_str())
}

/// Reading half of a framed connection.
pub struct FrameReader {
    reader: BufReader<TcpStream>,
}

impl FrameReader {
    /// Read one frame, blocking until a full frame is available.
    pub fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let mut header = [0u8; 5];
        self.reader.read_exact(&mut header)?;

        let kind = FrameKind::try_from(header[0])?;
        let payload_length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);

        if payload_length > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidPayloadSize(payload_length));
        }

        let mut payload = vec![0u8; payload_length as usize];
        if payload_length > 0 {
            self.reader.read_exact(&mut payload)?;
        }

        Frame::from_bytes(kind, &payload)
    }
}

/// Writing half of a framed connection.
pub struct FrameWriter {
    writer: BufWriter<TcpStream>,
}

impl FrameWriter {
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let bytes = frame.to_bytes()?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Full-duplex framed connection over a `TcpStream`.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, ProtocolError> {
        let reader_stream = stream.try_clone()?;
        let reader = FrameReader {
            reader: BufReader::new(reader_stream),
        };
        let writer = FrameWriter {
            writer: BufWriter::new(stream),
        };

        Ok(Connection { reader, writer })
    }

    /// Split into independently owned halves so a receive loop and senders
    /// can live on different threads.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    pub fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        self.reader.read_frame()
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.writer.write_frame(frame)
    }
}

// Helper functions for the length-prefixed wire encoding

fn write_string(buffer: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
}

fn read_string(reader: &mut &[u8]) -> Result<String, ProtocolError> {
    let bytes = read_bytes(reader)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
}

fn write_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
}

fn read_bytes(reader: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if reader.len() < 4 {
        return Err(ProtocolError::InvalidPayloadSize(reader.len() as u32));
    }

    let len = u32::from_le_bytes([reader[0], reader[1], reader[2], reader[3]]) as usize;
    *reader = &reader[4..];

    if reader.len() < len {
        return Err(ProtocolError::InvalidPayloadSize(reader.len() as u32));
    }

    let bytes = reader[..len].to_vec();
    *reader = &reader[len..];

    Ok(bytes)
}

fn write_headers(buffer: &mut Vec<u8>, headers: &[Header]) {
    buffer.extend_from_slice(&(headers.len() as u16).to_le_bytes());
    for (name, value) in headers {
        write_string(buffer, name);
        write_string(buffer, value);
    }
}

fn read_headers(reader: &mut &[u8]) -> Result<Vec<Header>, ProtocolError> {
    if reader.len() < 2 {
        return Err(ProtocolError::InvalidPayloadSize(reader.len() as u32));
    }

    let count = u16::from_le_bytes([reader[0], reader[1]]) as usize;
    *reader = &reader[2..];

    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_string(reader)?;
        let value = read_string(reader)?;
        headers.push((name, value));
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let bytes = frame.to_bytes().unwrap();
        let kind = FrameKind::try_from(bytes[0]).unwrap();
        let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(len, bytes.len() - 5);
        Frame::from_bytes(kind, &bytes[5..]).unwrap()
    }

    #[test]
    fn test_message_frame_roundtrip() {
        let frame = Frame::Message {
            headers: vec![
                ("Path".to_string(), "speech.config".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: br#"{"context":{}}"#.to_vec(),
        };

        match roundtrip(&frame) {
            Frame::Message { headers, body } => {
                assert_eq!(find_header(&headers, "Path"), Some("speech.config"));
                assert_eq!(body, br#"{"context":{}}"#.to_vec());
            }
            other => panic!("Unexpected frame: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_connect_ack_roundtrip() {
        let frame = Frame::ConnectAck {
            status: 401,
            message: "subscription key rejected".to_string(),
        };

        match roundtrip(&frame) {
            Frame::ConnectAck { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "subscription key rejected");
            }
            other => panic!("Unexpected frame: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_stream_frames_roundtrip() {
        let start = Frame::StreamStart {
            path: "/audio".to_string(),
            request_id: "9f4c2d8a2f7e4b1a".to_string(),
        };
        match roundtrip(&start) {
            Frame::StreamStart { path, request_id } => {
                assert_eq!(path, "/audio");
                assert_eq!(request_id, "9f4c2d8a2f7e4b1a");
            }
            other => panic!("Unexpected frame: {:?}", other.kind()),
        }

        let chunk = Frame::StreamChunk {
            body: vec![0u8; 1280],
        };
        match roundtrip(&chunk) {
            Frame::StreamChunk { body } => assert_eq!(body.len(), 1280),
            other => panic!("Unexpected frame: {:?}", other.kind()),
        }

        assert!(matches!(roundtrip(&Frame::StreamEnd), Frame::StreamEnd));
    }

    #[test]
    fn test_invalid_frame_kind() {
        assert!(matches!(
            FrameKind::try_from(0x7f),
            Err(ProtocolError::InvalidFrameKind(0x7f))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let frame = Frame::Event {
            headers: vec![("Path".to_string(), "turn.start".to_string())],
            body: vec![1, 2, 3],
        };
        let bytes = frame.to_bytes().unwrap();
        // Drop the last byte of the body
        let result = Frame::from_bytes(FrameKind::Event, &bytes[5..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::InvalidPayloadSize(_))));
    }
}
