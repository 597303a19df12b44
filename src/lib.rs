#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover
//!
//! Runs the processing engine over the Value/Operator demo metamodel on an
//! in-memory store. The binary in `main.rs` only parses arguments, sets up
//! tracing and waits for Ctrl+C; everything else lives here.

pub mod cli;
pub mod engine;

pub use cli::Cli;
pub use engine::{DemoEngine, build_store, load_config};
