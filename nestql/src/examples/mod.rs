//! Runnable walkthroughs over the Chinook fixture. Each `run()` asserts what
//! it demonstrates; `tests/examples.rs` executes all of them.

pub mod chinook;

pub mod example01_queries;
pub mod example02_nested_writes;
pub mod example03_permissions;
pub mod example04_router;
