//! Integration tests for DbRheo.
//!
//! Most tests run self-contained against in-memory SQLite and the mock
//! LLM service. Tests that need a live PostgreSQL server are skipped
//! unless DATABASE_URL is set.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
