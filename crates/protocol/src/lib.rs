pub mod client;
pub mod command;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod server;
pub mod transport;

pub use client::ControlClient;
pub use command::{CommandName, EventName};
pub use error::ProtocolError;
pub use message::{ErrorPayload, Message, PROTOCOL_VERSION};
pub use registry::{CommandHandler, CommandRegistry};
pub use server::{serve, ServerConfig};
pub use transport::default_socket_path;
