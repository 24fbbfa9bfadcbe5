//! Miscellaneous common structs used throughout the library.

mod closest_nodes;
mod content;
mod id;
pub mod messages;
mod node;
mod routing_table;

pub use closest_nodes::*;
pub use content::*;
pub use id::*;
pub use messages::{
    Message, MessageKind, WireMessage, CONNECT, FIND_NODES, MIN_APPLICATION_KIND, PING,
};
pub use node::*;
pub use routing_table::*;
