//! Per-query lifecycle coordination.
//!
//! The [`coordinator::Coordinator`] sequences a single statement through
//! settings, routing, transactions, admission, execution, caching and
//! finalization. Everything it talks to is behind a trait so that the
//! parser, engine, storage and transport can live elsewhere.
pub mod admission;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod distributed;
pub mod finalize;
pub mod interpreter;
pub mod parser;
pub mod process;
pub mod quota;
pub mod result;
pub mod routing;
pub mod statement;
pub mod telemetry;
pub mod txn;

pub mod testutil;
