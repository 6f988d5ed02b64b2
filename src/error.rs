use std::time::Duration;

use thiserror::Error;

/// Possible errors for the package.
#[derive(Error, Debug)]
pub enum RconError {
    /// Returned if the host is down, behind a firewall, or did not accept the
    /// connection within the connect timeout.
    #[error("host cannot be reached")]
    UnreachableHost(#[source] std::io::Error),
    /// Returned if you can't remember the password, or the server never
    /// answered the login.
    #[error("bad password")]
    AuthenticationError,
    /// The stream ended or failed in the middle of a packet. The connection
    /// it came from is no longer usable.
    #[error("packet truncated or unreadable")]
    FramingError(#[source] std::io::Error),
    /// Internal error used if the stream was successfully established, but
    /// there was a problem writing to the socket.
    #[error("cannot send message to host")]
    SendError(#[source] std::io::Error),
    /// Returned if the server did not respond in time.
    #[error("no response after {0:?}")]
    TimeoutError(Duration),
    /// A request was made before `configure` succeeded.
    #[error("client is not configured")]
    NotConfigured,
    /// The connection has no open stream to write to.
    #[error("not connected")]
    NotConnected,
    /// Returned by the test server if it can't listen on the given address.
    #[error("cannot bind listener")]
    BindError(#[source] std::io::Error),
    /// An environment variable held a value we could not parse.
    #[error("invalid value {value:?} for {var}")]
    InvalidConfig { var: &'static str, value: String },
}
