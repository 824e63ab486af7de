//! Clients for the systems the sinks write to, each behind a trait with a
//! production implementation and an in-memory one.
pub mod kv;
pub mod stream;
pub mod table;
