//! cftun command-line front-end
//!
//! The binary lives in `main.rs`; this library exposes the pieces that are
//! useful to test on their own.

pub mod settings;
