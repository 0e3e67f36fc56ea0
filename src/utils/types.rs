//! Module for type aliases that help to better identify field types

/// Identifier for a single multiplexed link within a hub. Zero is
/// reserved on the wire and never assigned.
pub type LinkId = u16;
