#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod resolve;

pub use config::ServerConfig;
pub use error::{Error, Result};
