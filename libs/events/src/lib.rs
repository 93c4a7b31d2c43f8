//! # bgwatch-events
//!
//! Event types delivered by the hardware control service's real-time feed.
//!
//! ## Design Principles
//!
//! - Vendor status codes are kept verbatim; interpreting them is the job of
//!   the reconciler, so unknown codes survive decoding instead of failing it
//! - Subscriptions declare a filter up front; this system only ever asks for
//!   block-level events
//! - The feed is line-delimited JSON, one frame per line
//!
//! ## Frames
//!
//! Client to server:
//! - `subscribe` with an [`EventFilter`]
//! - `request_updates` to start delivery after (re)subscribing
//!
//! Server to client:
//! - `subscribed` acknowledging the filter
//! - `block_state_changed` carrying a [`BlockStateChanged`]

mod error;
mod frames;
mod status;

pub use error::EventError;
pub use frames::*;
pub use status::*;
