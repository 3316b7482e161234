//! Console client for the Synapse session service.

pub mod config;
pub mod console;
pub mod playback;
