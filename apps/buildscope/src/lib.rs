//! # buildscope
//!
//! Command-line front end for the buildscope refactoring engine. The binary
//! in `main.rs` only sets up logging and dispatches to [`cli::execute`].

pub mod cli;
pub mod config;
