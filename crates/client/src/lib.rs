//! Terminal chat client.
//!
//! [`machine`] holds the protocol logic; [`app`] wires it to the keyboard,
//! the terminal and the [`connection`].

pub mod app;
pub mod commands;
pub mod connection;
pub mod console;
mod error;
pub mod machine;

pub use {app::run, error::ClientError};
