//! I/O adapters for the pipeline: processes, git, docker, the fix agent and run artifacts.

pub mod config;
pub mod docker;
pub mod fixer;
pub mod git;
pub mod patch;
pub mod process;
pub mod report;
pub mod run_log;
