//! Test infrastructure for index administration.
//!
//! Fixtures build document mappings and admins over an in-memory cluster so
//! every lifecycle scenario can be replayed without a running cluster.

#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;
