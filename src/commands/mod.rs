//! CLI command implementations for hostpulse.
//!
//! - `check`: requirement validation
//! - `config`: configuration file generation
//! - `test`: one-shot sampling and geolocation

pub mod check;
pub mod config;
pub mod test;

pub use check::command_check;
pub use config::command_config;
pub use test::command_test;
