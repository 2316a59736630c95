//! # coedit-core — sequence CRDT for collaborative plain text
//!
//! Every character gets an immutable, totally ordered [`Position`] the moment
//! it is created. A document is the set of `(Position, grapheme)` entries,
//! rendered by walking positions in order, never by replaying edits in the
//! order they arrived.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  between(prev, next)  ┌────────────────────┐
//! │ PositionAllocator  │ ◄──────────────────── │ SequenceDocument   │
//! │ (one per site)     │ ────────────────────► │ BTreeMap<Position, │
//! │ clock·site·counter │       Position        │          grapheme> │
//! └────────────────────┘                       └─────────┬──────────┘
//!                                                        │ Delta
//!                                                        ▼
//!                                                 remote replicas
//! ```
//!
//! ## Modules
//!
//! - [`position`] — `Stamp`, `Segment`, `Position` and the total order over them
//! - [`allocator`] — per-site stamp allocation and dense position generation
//! - [`document`] — the ordered document, local edits and idempotent remote deltas
//! - [`error`] — `CoreError` / `NotFound`

pub mod allocator;
pub mod document;
pub mod error;
pub mod position;

pub use allocator::{FixedClock, PositionAllocator, SiteClock, WallClock};
pub use document::{Applied, CharEntry, Delta, SequenceDocument};
pub use error::{CoreError, NotFound};
pub use position::{InvalidPosition, Position, Segment, Side, SiteId, Stamp};
