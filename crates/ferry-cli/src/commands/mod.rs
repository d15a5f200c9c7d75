//! Command handlers

pub mod config;
pub mod device;
pub mod lookup;
pub mod queue;
pub mod record;
pub mod status;
pub mod sync;
pub mod watch;
