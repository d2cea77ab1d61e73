// HTTP API

pub mod connections;

pub use connections::{create_connections_router, ConnectionsAppState};
