/// Sandbox container lifecycle: start/reattach, exec, idle sweep, teardown.
pub mod manager;
/// Host-side HTTP client for the in-container REPL service.
pub mod repl;

pub use manager::{ArtifactDescriptor, ExecOutcome, ExportResult, SessionManager};
pub use repl::{ExecResult, ReplClient};
