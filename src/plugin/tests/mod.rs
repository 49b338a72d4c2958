//! Shared plugin test fixtures
