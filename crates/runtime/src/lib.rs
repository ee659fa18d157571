//! Runtime support for compiled modules: the reserved-address-space
//! linear memory with its negative metadata region, the host-call (WASI)
//! bridge, and typed invocation of exported functions.

mod error;
mod host;
mod instance;
mod memory;
mod wasi;

extern crate presto_codegen as codegen;
extern crate presto_module as module;

pub use error::Error;
pub use host::HostTable;
pub use instance::{Instance, Value};
pub use memory::RuntimeMemory;
