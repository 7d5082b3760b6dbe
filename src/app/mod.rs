pub mod node;
pub mod peer_directory;
pub mod session_client;
pub mod session_server;
pub mod share_registry;
pub mod transfer;
