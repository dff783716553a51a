//! NecroCode — distributed build automation.
//!
//! Turns natural-language job descriptions into pull requests by
//! coordinating LLM-driven workers across a pool of git worktrees:
//! - Task registry with durable tasksets, dependency graphs, and an
//!   append-only event log
//! - Bounded repo pool with LRU slot allocation and recovery
//! - Dispatcher loop matching ready tasks to slots and workers
//! - Agent runner executing prepare → LLM → apply → test → push → report

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
