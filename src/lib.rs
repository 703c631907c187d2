//! Formgate - Signed-Token Rate Limiting for Form Submissions
//!
//! This crate replaces CAPTCHA-style checks with a rate limit that cannot be
//! bypassed by scripting: every protected submission must carry an HMAC-signed
//! token bound to the client address, the target path and an issue time, and
//! a client may only be admitted once per window on each path. Per-client
//! state lives behind a pluggable store and is reclaimed in the background.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
