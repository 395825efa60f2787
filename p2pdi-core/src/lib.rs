//! P2P-DI protocol reference implementation.
//! Host-driven: no I/O; the host owns sockets and timers and calls in.

pub mod index;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod wire;

pub use index::{DocumentId, DocumentIndex, DocumentStore, IndexError};
pub use protocol::{headers, Message, Method, PeerId, Response, Status, PROTOCOL_VERSION};
pub use session::{Session, SessionError, SessionState, SessionTable};
pub use wire::{
    decode_message, decode_response, encode_frame, encode_message, encode_response, FormatError,
    FrameError,
};
