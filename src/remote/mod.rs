//! Access to remote systems: ssh local-forward tunnels and remote command execution.

pub mod command;
pub mod tunnel;

pub use command::{
    curl_command, parse_response, CommandTransport, RemoteCommandResult, RemoteCommandRunner,
    RemoteError, ResponseExpectation, SshTransport,
};
pub use tunnel::{TunnelError, TunnelHandle, TunnelManager, TunnelState};
