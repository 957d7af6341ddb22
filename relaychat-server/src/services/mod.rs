//! Write-side commands, read-side queries and real-time fan-out.
pub mod chat_service;
pub mod fanout;
pub mod publisher;
pub mod query_service;

pub use chat_service::{ChatService, ChatServiceError};
pub use fanout::{FanoutHub, SharedFanoutHub};
pub use publisher::EventPublisher;
pub use query_service::{QueryService, QueryServiceError};
