//! Ackbus - acknowledged messaging client layer
//!
//! Publishers, subscribers and a lazy fire-and-forget sender on top of a
//! message broker, with acknowledgments carried as request/reply answers.

pub mod bus;
pub mod config;
pub mod utils;
