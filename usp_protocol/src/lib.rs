pub mod protocol;

pub use protocol::{
    find_header, Connection, Frame, FrameKind, FrameReader, FrameWriter, Header, ProtocolError,
    CONNECT_STATUS_OK,
};
