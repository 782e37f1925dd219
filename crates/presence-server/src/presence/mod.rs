//! Presence state: which user identities are currently online.

pub mod registry;

pub use registry::PresenceRegistry;
