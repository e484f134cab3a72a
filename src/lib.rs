//! # flapi
//!
//! Turns YAML-declared SQL templates into live REST + MCP APIs, powered by
//! Apache DataFusion and Rust.
//!
//! ## Overview
//!
//! flapi lets you:
//! - **Declare** a REST (or MCP tool/resource/prompt) endpoint as a YAML
//!   file plus a SQL template, with typed/validated request parameters
//! - **Query** an embedded DataFusion engine directly, or against scheduled
//!   snapshot caches refreshed from an external connection
//! - **Expose** both surfaces — REST and MCP JSON-RPC — from one process,
//!   with Basic/JWT/OIDC auth, pagination, and CSV negotiation
//!
//! ## Quick Start
//!
//! ```no_run
//! use flapi::cmd::Cli;
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> flapi::Result<()> {
//!     let cli = Cli::parse();
//!     flapi::cmd::run_server(&cli).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! flapi.yaml + endpoints/*.yaml ─▶ Config ─▶ axum Router (REST + MCP + management)
//!                                               │
//!                                               ▼
//!                                     DataFusion SessionContext
//!                                       (direct query or cache catalog)
//! ```

// Public API exports
pub use errors::{ApitapError, Result};

// Public modules
pub mod auth;
pub mod cache;
pub mod cmd;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod log;
pub mod management;
pub mod mcp;
pub mod server;
pub mod slug;
pub mod sqlengine;
pub mod template;
pub mod utils;
pub mod validators;
