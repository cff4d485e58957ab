//! Node-side control plane for replicated block volumes.
//!
//! `volmgr node` runs the target server, the restore controller and the
//! disruption-budget controller against a file-backed cluster store. `volctl`
//! talks to a running node over its admin socket.

pub mod admin;
pub mod budget_controller;
pub mod config_file;
pub mod config_resync;
pub mod listener;
pub mod node;
pub mod restore_controller;
pub mod restore_executor;
pub mod store;
pub mod target_server;
pub mod work_queue;

pub use node::{run_node, run_node_with_shutdown, NodeArgs};
pub use store::FileClusterStore;
