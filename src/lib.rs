pub mod client;
pub mod common;
pub mod reference;
pub mod relay;
pub mod server;

pub use common::clock::LogicalClock;
pub use common::config::ClusterConfig;
pub use common::messages::{Request, Response};
pub use reference::ReferenceService;
pub use server::{ChatCore, ChatServerMiddleware};
