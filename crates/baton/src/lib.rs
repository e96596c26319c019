#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(not(unix))]
compile_error!("baton maps files with mmap(2) and only supports unix targets");

pub mod channel;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod namespace;
pub mod segment;

pub use channel::{Channel, ChannelState, DeleteOnDrop};
pub use config::{ChannelConfig, PollStrategy, Side};
pub use control::{ControlBlock, ControlSnapshot, PROTOCOL_VERSION};
pub use data::DataSegment;
pub use error::{Error, ErrorKind, Result};
pub use namespace::{Namespace, delete_files};
pub use segment::MappedSegment;
