//! Quay Daemon (quayd)
//!
//! Runs one cluster controller and exposes its admin operations over HTTP.
//!
//! ## Quick Start
//!
//! ```bash
//! # First instance, then bootstrap it through the admin API
//! quayd --cluster-bind 0.0.0.0:3301 --api-bind 0.0.0.0:8081 --alias router
//! curl -XPOST localhost:8081/admin/api -d '{"op":"join_server","uri":"localhost:3301"}'
//!
//! # Further instances are probed and joined from any bootstrapped member
//! quayd --cluster-bind 0.0.0.0:3302 --api-bind 0.0.0.0:8082 --alias storage-1
//! curl -XPOST localhost:8081/admin/api -d '{"op":"probe_server","uri":"localhost:3302"}'
//! curl -XPOST localhost:8081/admin/api -d '{"op":"join_server","uri":"localhost:3302","roles":["vshard-storage"]}'
//! ```

pub mod cli;
pub mod server;

pub use cli::{Cli, Quorum};
pub use server::{create_admin_router, start_admin_server, with_custom_routes, AdminState};
