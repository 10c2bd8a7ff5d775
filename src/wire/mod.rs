//! Wire protocol for hashsync.
//!
//! One connection carries exactly one exchange:
//!
//! ```text
//! client                                server
//!   | -- Request frame (PushFile, ...) --> |
//!   | <-- Response frame (Ack, ...) ------ |
//!   x                                      x
//! ```
//!
//! Every frame is `command:u8 | len:u32 (BE) | payload`, with the payload run
//! through the shared-key cipher.

pub mod frame;
pub mod protocol;

pub use frame::{Frame, FrameCodec, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
pub use protocol::{
    Command, FileHeader, FilePayload, Request, Response, CHECK_MARKER, SEQ_LEN_PREFIX,
};
