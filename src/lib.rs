//! DbRheo: a conversational database agent core.
//!
//! A user issues natural-language requests; the model plans; the core
//! executes SQL, schema discovery, file, shell, HTTP, and code tools on
//! the user's behalf with a risk-gated scheduler, streaming everything
//! back as typed events.

pub mod chat;
pub mod cli;
pub mod client;
pub mod compressor;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod next_speaker;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod tools;
pub mod transaction;
pub mod turn;
pub mod types;

pub use client::{AgentClient, AgentEvent};
pub use error::{DbRheoError, Result};
