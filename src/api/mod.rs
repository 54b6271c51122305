pub mod rest;
pub mod sse;
pub mod ws;

pub use rest::router;

// ---------------------------------------------------------------------------
// End-to-end tests: real server on a loopback port, real clients.
// ---------------------------------------------------------------------------
