//! Process-related modules.
//!
//! - `scanner`: process discovery under /proc
//! - `cpu`: per-process CPU time parsing and delta tracking
//! - `connections`: socket table with owning process names
//! - `attributor`: remote endpoint to process name lookup

pub mod attributor;
pub mod connections;
pub mod cpu;
pub mod scanner;

pub use attributor::{ProcessAttributor, UNKNOWN_APP};
pub use connections::{AttributionQuery, ConnectionSource, ConnectionTable, ProcConnectionSource};
pub use cpu::{CpuTracker, CLK_TCK};
pub use scanner::{collect_proc_entries, read_process_name};
