//! Side-effecting adapters: state stores, capability ports, config, git and
//! child processes.

pub mod code_host;
pub mod command_planner;
pub mod config;
pub mod file_store;
pub mod git;
pub mod init;
pub mod local_ports;
pub mod memory_store;
pub mod ports;
pub mod process;
pub mod state_store;
pub mod tool_catalog;
