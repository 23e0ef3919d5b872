//! Remote agent protocol client.
//!
//! The controller fronts every agent session with an HTTP/JSON API. All
//! agent-side work is asynchronous: submit a task, then poll for its result.

pub mod client;
pub mod models;
pub mod traits;

pub use client::AgentClient;
pub use traits::{
    AgentApi, AgentError, CommandOutput, DirEntry, DiskInfo, FileOp, FileOperationResult,
    HostInfo, NicInfo, PollSettings, PublishedFile, SystemInfo, TaskId, TaskPayload, TaskPoll,
};
