//! # notectx
//!
//! Index exported personal notes into named vector collections and serve
//! cited context to AI tools.
//!
//! The runtime-agnostic logic (validation, chunking, the indexing pipeline,
//! the registry, and retrieval) lives in the `notectx-core` crate. This
//! crate supplies the pieces that touch the outside world: TOML config, the
//! SQLite vector store, HTTP embedding providers, the CLI commands, and the
//! HTTP/MCP server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ notes.json  │──▶│ Pipeline (core)      │──▶│  SQLite  │
//! │ (extractor) │   │ validate→chunk→embed │   │ vectors  │
//! └─────────────┘   └──────────┬───────────┘   └────┬─────┘
//!                              │ HTTP               │
//!                       ┌──────▼──────┐     ┌───────┴────────┐
//!                       │ Ollama /    │     ▼                ▼
//!                       │ OpenAI API  │ ┌────────┐     ┌───────────┐
//!                       └─────────────┘ │  CLI   │     │ HTTP + MCP│
//!                                       └────────┘     └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `VectorStore` |
//! | [`embedding`] | HTTP embedding providers |
//! | [`ingest`] | `notectx index` |
//! | [`search`] | `notectx search` |
//! | [`stats`] | `notectx collections` |
//! | [`tools`] | Agent-facing tools |
//! | [`server`] | HTTP server |
//! | [`mcp`] | MCP protocol bridge |

pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod mcp;
pub mod migrate;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod tools;
