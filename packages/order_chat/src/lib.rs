//! Realtime chat sessions for order items.
//!
//! Each open chat keeps a push-channel subscription alive with bounded
//! backoff, shows sends immediately and reconciles them with the stored
//! records, tracks who is online or typing, and falls back to polling when
//! the push channel is out.
//!
//! ```no_run
//! use std::sync::Arc;
//! use order_chat::memory::{MemoryPresence, MemoryStore, MemoryTransport, StaticIdentity};
//! use order_chat::{ChatConfig, ChatId, ChatOrchestrator, Collaborators};
//!
//! # async fn demo() -> order_chat::ChatResult<()> {
//! let orchestrator = ChatOrchestrator::new(
//!     Collaborators {
//!         store: Arc::new(MemoryStore::new()),
//!         transport: Arc::new(MemoryTransport::new()),
//!         identity: Arc::new(StaticIdentity::admin("admin-1")),
//!         presence: Arc::new(MemoryPresence::new()),
//!     },
//!     ChatConfig::default(),
//! );
//! let chat = orchestrator.open(ChatId::new("item-42")).await?;
//! let receipt = chat.send_message("Seu pedido já foi enviado.").await?;
//! receipt.confirmed().await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod presence;
pub mod session;
pub mod sync;
pub mod timer;
pub mod typing;

pub use config::ChatConfig;
pub use error::{ChatError, ChatResult};
pub use model::{ChatId, ConnectionState, CurrentUser, Message, PresenceStatus, SenderType};
pub use orchestrator::ChatOrchestrator;
pub use ports::{Collaborators, IdentityProvider, MessageStore, PresenceDirectory, PushTransport};
pub use session::{ChatEvent, ChatHandle, ChatSnapshot, SendReceipt};
