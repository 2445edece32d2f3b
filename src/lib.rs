//! Ollama-compatible reverse proxy for OpenAI-style inference servers.
//!
//! Editor AI clients (VS Code Copilot BYOK among them) speak the Ollama
//! HTTP dialect; local inference servers such as llama-server speak the
//! OpenAI dialect. This crate sits between the two: it normalizes the
//! discovery endpoints (`/api/tags`, `/api/show`, `/api/embed`), routes
//! chat requests, and re-encodes the upstream SSE stream into whatever
//! wire format the client negotiated — SSE or NDJSON, OpenAI or Ollama
//! schema — optionally surfacing the hidden `reasoning_content` channel
//! into the visible text stream.

#![deny(unsafe_code)]

pub mod aliases;
pub mod chat;
pub mod config;
pub mod discovery;
pub mod encode;
pub mod forward;
pub mod frames;
pub mod models;
pub mod reasoning;
pub mod server;
pub mod stream;

pub use config::Config;
pub use server::{ProxyState, serve};
