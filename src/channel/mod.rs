//! Realtime session channel modules.
//!
//! - `manager`: websocket transport ownership, reconnect handling, and typed
//!   event dispatch.
//! - `proto`: wire envelopes and event payloads shared with the server.
//! - `binding`: glue that ties a channel's lifecycle to a UI session's
//!   lifetime.

/// Session-lifetime binding over the channel manager.
pub mod binding;
/// Websocket connection, reconnect state machine, and handler registry.
pub mod manager;
/// Channel protocol envelopes and payloads.
pub mod proto;
