pub mod buffer;
pub mod collective;
pub mod comm;
pub mod config;
pub mod context;
pub mod error;
mod group;
pub mod host;
pub mod runtime;
pub mod status;
pub mod token;
pub mod types;

pub use buffer::BufferDesc;
pub use collective::{StreamBinding, Submission};
pub use comm::{Communicator, Health};
pub use config::RncclConfig;
pub use context::CommContext;
pub use error::{Result, RncclError};
pub use host::{HandleId, HostApi};
pub use runtime::{
    CollectiveCall, LoopbackFabric, LoopbackRuntime, NativeRuntime, RawComm, StreamId,
};
pub use status::{NativeResult, NativeStatus, StatusClass};
pub use token::{GroupToken, TOKEN_BYTES};
pub use types::{CustomReduce, DataType, Element, Rank, ReduceOp};
