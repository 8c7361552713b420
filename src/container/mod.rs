/// Subprocess-based Docker interaction (tar put/get, exec, lifecycle).
pub mod docker;

pub use docker::{CreateContainerOpts, DockerIo, ExecOutput, Mount, NetworkMode};
