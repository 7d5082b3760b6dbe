pub mod app;
pub mod core;
pub mod infrastructure;

pub use crate::app::node::NodeService;
pub use crate::app::session_client::{ClientIdentity, SessionClient};
pub use crate::core::models::NodeEvent;
pub use crate::core::{AppError, AppResult};
pub use crate::infrastructure::config::NodeConfig;
