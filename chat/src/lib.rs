//! # courier-chat
//!
//! Real-time delivery core of a chat service.
//!
//! Persistent client connections are registered with a single dispatch loop
//! that owns the registry of connected users. Read-readiness is multiplexed
//! across all sockets, messages are validated and routed to online, offline
//! or group recipients, and presence is tracked per user.
//!
//! - **[`Chat`] / [`ChatHandle`]** - the dispatch loop and its cloneable entry point
//! - **[`User`]** - one authenticated connection with serialized I/O
//! - **[`Multiplexer`] / [`Observer`]** - read-readiness notifications
//! - **[`Executor`]** - bounded background work, [`WorkerPool`] by default
//! - **[`MessageRouter`]** - fallback for group, offline and failed deliveries
//! - **[`StatusManager`]** - ONLINE/OFFLINE transitions
//! - **[`ErrorDispatcher`]** - single funnel for asynchronous failures
//!
//! ## Wire format
//!
//! Every frame is a JSON [`Message`]:
//!
//! ```text
//! {"id":"...","from":"alice","to":"bob","date":"2024-05-01T12:00:00Z","content_type":"TEXT","content":"hi"}
//! ```
//!
//! Control frames answering a message reuse its `id` with a `content_type` of
//! `ACK` (content `"sent"`) or `ERROR` (content is the reason).
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier_chat::*;
//!
//! let config = ChatConfig::load(None)?;
//! let repository = Arc::new(MemoryRepository::new());
//! let framing = Arc::new(LineFraming::new(config.max_frame_length));
//! let chat = Chat::new(
//!     &config,
//!     Collaborators {
//!         repository: repository.clone(),
//!         bus: Arc::new(LocalBus::new()),
//!         groups: Arc::new(my_groups),
//!         offline: repository,
//!         executor: Arc::new(WorkerPool::start(config.workers)),
//!         multiplexer: Arc::new(TokioMultiplexer::current()?),
//!         reader: framing.clone(),
//!         writer: framing,
//!     },
//! )
//! .start();
//!
//! chat.register("alice", socket).await?;
//! ```

pub mod bus;
mod chat;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod framing;
pub mod message;
pub mod observer;
pub mod repository;
pub mod router;
pub mod status;
mod user;


pub use bus::{Event, EventBus, EventCallback, LocalBus};
pub use chat::{Chat, ChatHandle, Collaborators};
pub use config::ChatConfig;
pub use dispatcher::{ErrorDispatcher, ErrorEvent};
pub use error::{BusError, ChatError, RepositoryError, TransportError, ValidationError};
pub use executor::{job, Executor, Job, WorkerPool};
pub use framing::{Frame, FrameDecoder, LineFraming, Reader, Writer, DEFAULT_MAX_FRAME_LENGTH};
pub use message::{message_id, ContentType, Message, UserStatus, ACK_CONTENT};
pub use observer::{Multiplexer, Observer, Readiness, ReadinessCallback, TokioMultiplexer};
pub use repository::{MemoryRepository, Repository, UserOnline};
pub use router::{GroupDispatcher, MessageRouter, OfflineDispatcher};
pub use status::{PresenceEvent, StatusManager};
pub use user::User;
