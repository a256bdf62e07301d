//! Tool registry and dispatch.

pub mod catalogue;
pub mod dispatcher;

pub use catalogue::{
    FnHandler, SandboxOp, SandboxToolSpec, ToolCatalogue, ToolDescriptor, ToolHandler,
};
pub use dispatcher::ToolDispatcher;
