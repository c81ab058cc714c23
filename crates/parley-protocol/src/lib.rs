//! # parley-protocol
//!
//! Wire protocol for the Parley direct-messaging server.
//!
//! ## Frame Types
//!
//! - `connect` / `connected` - Handshake
//! - `send-message`, `load-conversation`, `load-inbox`, `mark-read`,
//!   `delete-message` - Client requests
//! - `sent`, `conversation`, `inbox`, `ack`, `error` - Replies to the requester
//! - `message`, `message-deleted`, `messages-read` - Live pushes
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame};
//!
//! let frame = Frame::send_message(1, "u2", "hi");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//!
//! let text = codec::encode_json(&frame).unwrap();
//! assert_eq!(codec::decode_json(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod model;
pub mod version;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use frames::{ErrorKind, Frame, FrameType};
pub use model::{InboxThread, Message, MessageId, UserId};
pub use version::{Version, PROTOCOL_VERSION};
