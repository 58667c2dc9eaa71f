//! Shared utilities: decimal arithmetic and durable file IO.

pub mod decimal;
pub mod fs;
