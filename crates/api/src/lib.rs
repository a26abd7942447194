//! Nudge RPC server.
//!
//! Endpoints:
//! - POST /rpc/schedule_reminder — schedule a push through the provider
//! - POST /rpc/cancel_reminder — cancel a scheduled push
//! - GET  /health

pub mod routes;
pub mod state;
