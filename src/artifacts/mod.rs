/// Catalog bootstrap, ingest, and read-side queries.
pub mod store;
/// HMAC-signed, time-limited download tokens.
pub mod tokens;
/// Axum routes serving artifact bytes and metadata.
pub mod api;

pub use store::{Artifact, ArtifactStore, IngestedArtifact};
pub use tokens::TokenService;
