#[macro_use]
extern crate tracing;

pub mod cmd;
pub mod compute;
pub mod errors;
pub mod merge;
pub mod model;
pub mod ql;
pub mod runtime;
pub mod services;
pub mod storage;
