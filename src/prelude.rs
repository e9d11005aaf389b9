//! Convenience re-exports for the common path.

pub use crate::{
    Multiplexer, MuxConfig, MuxError, MuxEvent, MuxStatus, Priority, RagRequest, RagResponse,
    ServerConfig, StrategyKind,
};
