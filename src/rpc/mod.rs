//! JSON-RPC handling
//!
//! Method registration, envelope formatting and the per-call dispatcher.

pub mod dispatcher;
pub mod envelope;
pub mod registry;

pub use dispatcher::{HandlerOptions, JsonRpcHandler};
pub use envelope::ReplyMessage;
pub use registry::{MethodError, MethodRegistry, MethodResult, Params, RegistryError, RpcMethods};
