//! # parley-core
//!
//! Direct-messaging core for Parley.
//!
//! - **Store** - Durable, ordered message log behind the [`MessageStore`] trait
//! - **Sessions** - Live connections per authenticated user
//! - **Router** - Live fan-out of new, deleted and read messages
//! - **Receipts** - One-way `unread -> read` transitions
//! - **Service** - Typed commands shared by every transport
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Gateway    │────▶│ ChatService │────▶│ MessageStore │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────────┐
//!                     │   Router    │────▶│ SessionRegistry │
//!                     └─────────────┘     └─────────────────┘
//! ```

pub mod auth;
pub mod error;
pub mod inbox;
pub mod receipts;
pub mod router;
pub mod service;
pub mod session;
pub mod store;

pub use auth::{Identity, JwtValidator, TokenValidator};
pub use error::{ChatError, ChatResult};
pub use receipts::ReadReceipts;
pub use router::{DeliveryReport, DeliveryRouter};
pub use service::{Caller, ChatService, Sent};
pub use session::{ConnectionId, Outbox, Session, SessionRegistry};
pub use store::{MemoryStore, MessageStore};
