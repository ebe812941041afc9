#[macro_use]
extern crate log;

pub mod api;
pub mod cli;
pub mod cond;
pub mod crashlog;
pub mod env;
pub mod errlog;
pub mod error;
pub mod failure;
pub mod ipc;
pub mod logger;
pub mod netrx;
pub mod parser;
pub mod procs;
pub mod rule;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use miette::Result;
