//! Process model and message protocol for Branchline.
//!
//! This crate contains the data model of the engine: expression trees,
//! flow-expression identities, workitems, flow-control commands, the engine
//! message protocol, and the failure taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod command;
pub mod error;
pub mod fei;
pub mod message;
pub mod node;
pub mod workitem;
