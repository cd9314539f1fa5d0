//! stowage - object storage client with resumable multipart transfers

pub mod cli;
pub mod config;
pub mod core;
pub mod s3;

pub use core::Core;
pub use config::Config;
