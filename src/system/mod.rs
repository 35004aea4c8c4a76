//! Operating-system plumbing: child processes and local TCP ports.

pub mod port;
pub mod process;

pub use port::{PortError, PortGuard};
pub use process::{terminate_child, ExternalProcessResult};
