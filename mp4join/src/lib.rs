//! mp4join library crate.
//!
//! Accepts a video file uploaded as a fixed number of independent parts,
//! reassembles the parts with an external lossless concatenation tool once
//! all of them have arrived, and streams the result back over HTTP with
//! flow control.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logging;
pub mod panic_hook;
pub mod storage;
pub mod stream;
pub mod sweep;

pub use error::{Error, Result};
