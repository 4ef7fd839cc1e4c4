//! Core engine for the multi-server snapshot manager: snapshot tree
//! flattening, chain and age classification, remote task polling, and
//! per-server dispatch of bulk operations.
//!
//! The GUI shell, credential storage, and the real management API client are
//! external collaborators; they plug in through the `ManagementApi` trait and
//! the `WorkflowEvent` stream defined in `snapmgr-common`.

pub mod classify;
pub mod connection;
pub mod dispatch;
pub mod poller;
pub mod test_utils;
pub mod walker;
pub mod workflow;

pub use snapmgr_common as common;

pub use connection::ConnectionRegistry;
pub use workflow::{FetchOptions, SessionController, WorkflowConfig, WorkflowHandle};
