#![forbid(unsafe_code)]

pub mod archive;
pub mod batch;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod interactive;
pub mod job;
pub mod logging;
pub mod progress;
