//! In-process tool servers.
//!
//! The logbook and knowledge-graph retrieval cores are exposed to the
//! agent through the same [`ToolServer`](crate::ToolServer) seam as remote
//! servers, so the orchestrator never special-cases them.

pub mod elog;
pub mod graph;

pub use elog::ElogToolServer;
pub use graph::GraphToolServer;
