//! sandboxd: a sandboxed code-execution service. Owns a long-lived Docker
//! container per conversation, stages datasets into it, executes code
//! through an in-container REPL, and serves generated files back out over a
//! signed-URL artifact API.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![warn(missing_copy_implementations)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// HMAC-signed download tokens, the catalog/blob store, and the axum routes
/// that serve artifact bytes and metadata.
pub mod artifacts;
/// Application configuration: session storage mode, dataset access mode,
/// and the fixed paths/secrets derived from them.
pub mod config;
/// Subprocess-based Docker interaction: tar put/get, exec, lifecycle.
pub mod container;
/// Per-session dataset cache and the staging logic that places dataset
/// bytes where the sandbox expects to find them.
pub mod datasets;
/// Typed error enums for each subsystem.
pub mod error;
/// Sandbox container lifecycle and the host-side REPL client.
pub mod session;
/// Shared filesystem path helpers.
pub mod utils;
