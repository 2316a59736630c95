//! # coedit-collab — rooms, presence and the WebSocket gateway
//!
//! Hosts shared [`coedit_core::SequenceDocument`]s in named rooms and relays
//! document deltas and presence between the people editing them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON / bincode   ┌────────────────┐
//! │ editor      │ ◄────────────────► │ SessionGateway │
//! │ (per user)  │     WebSocket      │ (task/socket)  │
//! └─────────────┘                    └───────┬────────┘
//!                                            │ ClientMessage
//!                                            ▼
//!                                    ┌────────────────┐
//!                                    │ CollabEngine   │
//!                                    └───┬────────┬───┘
//!                                        │        │ Envelope
//!                                        ▼        ▼
//!                              ┌──────────────┐ ┌────────────┐
//!                              │ RoomRegistry │ │ SessionHub │
//!                              │ (room locks) │ │ (fan-out)  │
//!                              └──────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — `ClientMessage` / `ServerMessage` and their wire encodings
//! - [`presence`] — cursor, highlight and typing state
//! - [`room`] — one room: document, members, presence
//! - [`registry`] — the room table with per-room exclusion
//! - [`broadcast`] — fan-out to other members and session delivery
//! - [`engine`] — transport-free operation handling
//! - [`gateway`] — WebSocket server
//! - [`config`] — `ServerConfig`

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;

// Re-exports for convenience
pub use broadcast::{direct, fan_out, Envelope, HubStats, SessionHub, SessionId, Target};
pub use config::{ConfigError, ServerConfig};
pub use engine::{CollabEngine, Session};
pub use gateway::{GatewayStats, SessionGateway};
pub use presence::{Highlight, PresenceState, SelectionRange, Vec2};
pub use protocol::{ClientMessage, DeltaKind, ProtocolError, ServerMessage, WireFormat};
pub use registry::{RoomFull, RoomRegistry};
pub use room::{Room, RoomSnapshot, RoomState};
