//! Integration test suite for conductor.
//!
//! These tests run the coordinator, worker pool and workspace isolator
//! together against temporary git repositories and SQLite stores.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency order, concurrency ceiling, deadlines, full runs
//! - `workspace`: isolation, commits, merges and conflict handling
//! - `recovery`: restart against a file-backed store
//! - `shutdown`: signal handling with work in flight
//!
//! Workers are mocked; no external binary is invoked.

mod fixtures;

mod recovery;
mod scheduling;
mod shutdown;
mod workspace;
