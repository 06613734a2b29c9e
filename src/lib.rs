//! User-facing Rust SDK for the brainstorm realtime session service.
//!
//! The crate is organized by transport surface:
//! - `channel`: realtime websocket channel manager and session binding.
//! - `session_api`: HTTP client for session CRUD and brainstorm control.
//! - `retry`: shared retry and timeout utilities.

/// Realtime channel manager, protocol types, and session binding helpers.
pub mod channel;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Session API client and resource types.
pub mod session_api;
