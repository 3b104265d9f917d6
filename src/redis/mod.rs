//! Redis-backed shared store.
//!
//! Callers on any number of hosts share buckets through one Redis deployment.
//! Each admission check is a single Lua script, which Redis runs without
//! interleaving any other command, and the script reads time from the server's
//! `TIME` so no caller's local clock ever enters the arithmetic.

mod redis_token_bucket;
pub use redis_token_bucket::*;

mod common;
pub use common::*;
