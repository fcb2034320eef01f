//! rqd is a render-farm host agent. It accepts frame launch requests from a
//! central dispatcher over gRPC, runs each frame as a supervised child
//! process in its own session, captures the frame's output and resource
//! usage, and reports host and per-frame state back on demand.
//!
//! The agent is stateless across restarts: a crash abandons running
//! children to the host OS.

pub mod config;
pub mod environment;
pub mod error;
pub mod frame;
pub mod lock;
pub mod machine;
pub mod output;
pub mod procfs;
pub mod reaper;
pub mod registry;
pub mod rqcore;
pub mod sampler;
pub mod server;

pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("rqd");
}
