//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod acceptance;
pub mod cascade;
pub mod checkpoint;
pub mod command_check;
pub mod machine;
pub mod truncate;
pub mod types;
