//! Package protocol modules.

pub mod command;
pub mod frame;
pub mod package;
pub mod payloads;

pub use command::{CLIENT_VERSION, Command};
pub use frame::{FRAME_HEADER_LEN, FrameError, FrameReader, FrameWriter, encode_frame};
pub use package::{Credentials, Package, PackageDecodeError, PackageEncodeError};
pub use payloads::{
    Endpoint, NodeEndpoints, NotHandledPayload, NotHandledReason, PayloadDecodeError,
    PayloadEncodeError, decode_not_handled, decode_reason_text, encode_not_handled,
};
