pub mod auth;
pub mod chats;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod history;
pub mod queue;
pub mod reconciler;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use chats::ChatDirectory;
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::ChatSessionCoordinator;
pub use errors::{ClientError, ClientResult};
pub use events::SessionEventBus;
pub use history::{HttpMessageHistory, MessageHistory, MessagePage};
pub use queue::{FrameKind, OutboundFrame, OutboundMessageQueue};
pub use reconciler::{AdmitOutcome, MessageReconciler};
