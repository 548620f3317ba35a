//! Replays archived OpenEEW accelerometer readings into the input stream at
//! the rate the sensors produced them.

pub mod archive;
pub mod config;
pub mod error;
pub mod metrics_consts;
pub mod replayer;
pub mod source;
pub mod writer;
