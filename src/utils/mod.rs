/// Standard filesystem paths (blob root, metadata DB, sessions root).
pub mod paths;

pub use paths::base_dir;
