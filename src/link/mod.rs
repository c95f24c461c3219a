//! Device link: transport, framing, connection state machine and reconnect loop.

pub mod backoff;
pub mod command;
pub mod framing;
pub mod manager;
pub mod state;
pub mod transport;

pub use backoff::{Attempt, Backoff};
pub use command::DeviceCommand;
pub use framing::{FramedLine, LineFramer};
pub use manager::{DeviceLink, LinkStats};
pub use state::ConnectionState;
pub use transport::{TcpTransport, Transport};
