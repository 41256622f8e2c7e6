//! Data models for the peer mesh
//!
//! These types are shared by the signaling relay, the peer wire and the
//! events handed to the UI layer.

mod types;

pub use types::*;
