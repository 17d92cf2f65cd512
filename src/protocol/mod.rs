//! Push/fetch protocol server: authenticated endpoints over HTTP and SSH
//! for reference resolution, metadata and object transfer, batch checks
//! and pushes.

pub mod auth;
pub mod core;
pub mod fetch;
pub mod http;
pub mod push;
pub mod ssh;
pub mod types;
