//! Network surface of a quorumkv node

mod http;
mod middleware;
mod node;

pub use http::{create_router, NodeState};
pub use middleware::REQUEST_ID_HEADER;
pub use node::Node;
