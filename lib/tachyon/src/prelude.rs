pub use crate::client::{Client, ClientApp, ClientConfig, ConnectionState, RosterEntry};
pub use crate::net::message::{opcode, ReliableMessage};
pub use crate::net::queue::MessageSender;
pub use crate::predict::PredictionConstants;
pub use crate::server::{ClientInfo, Server, ServerApp, ServerConfig, ServerWorker};
pub use crate::state::node::NodeType;
pub use crate::state::object::{MemberDef, ReplicableObject};
pub use crate::state::remote::RemoteFactory;
pub use crate::state::tree::{Backing, StateTree};
