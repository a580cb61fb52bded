pub mod autofix;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod providers;
pub mod sandbox;

pub use error::{Result, RunletError};
