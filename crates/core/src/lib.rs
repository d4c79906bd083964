//! Core types for the voice bridge
//!
//! This crate provides foundational types used across all other crates:
//! - Audio formats and fixed 20ms frames
//! - Frame buffer pooling
//! - PCM sample helpers
//! - Error types

pub mod audio;
pub mod error;
pub mod pcm;
pub mod pool;

pub use audio::{AudioFormat, AudioFrame, G711Law, FRAME_MS, TELEPHONY_SAMPLE_RATE};
pub use error::{Error, Result};
pub use pool::FramePool;
