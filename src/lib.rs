//! meshdm — mesh radio DM bot: AI replies, weather lookups, and two-way
//! email bridging over a publish/subscribe mesh gateway.

pub mod ai;
pub mod chunker;
pub mod config;
pub mod downlink;
pub mod envelope;
pub mod error;
pub mod mail;
pub mod router;
pub mod session;
pub mod transport;
pub mod weather;
