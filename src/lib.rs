/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod logger;
pub mod monitor;
pub mod process;
pub mod server;
pub mod shell;
pub mod signals;
pub mod supervisor;
pub mod table;
