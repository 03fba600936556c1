//! The dispatch loop: a single task that exclusively owns the registry of
//! connected users and serializes every registration, deregistration and
//! routing decision. Everything that may block is handed to the executor.
//!
//! ```ignore
//! let chat = Chat::new(&config, collaborators).start();
//! chat.register("alice", socket).await?;
//! chat.send_message(Message::new("bob", "alice", "", "TEXT", "hi")?).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_rt::net::TcpStream;
use courier_rt::{self as rt, mpsc, oneshot, CancellationToken};

use crate::bus::EventBus;
use crate::config::ChatConfig;
use crate::dispatcher::ErrorDispatcher;
use crate::error::{ChatError, TransportError};
use crate::executor::{job, Executor};
use crate::framing::{Reader, Writer};
use crate::message::{Message, UserStatus};
use crate::observer::{Multiplexer, Observer, Readiness, ReadinessCallback};
use crate::repository::Repository;
use crate::router::{GroupDispatcher, MessageRouter, OfflineDispatcher};
use crate::status::StatusManager;
use crate::user::User;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// External services the dispatch loop is wired to.
pub struct Collaborators {
    pub repository: Arc<dyn Repository>,
    pub bus: Arc<dyn EventBus>,
    pub groups: Arc<dyn GroupDispatcher>,
    pub offline: Arc<dyn OfflineDispatcher>,
    pub executor: Arc<dyn Executor>,
    pub multiplexer: Arc<dyn Multiplexer>,
    pub reader: Arc<dyn Reader>,
    pub writer: Arc<dyn Writer>,
}

enum Command {
    Register {
        user: Arc<User>,
        observer: Arc<dyn Observer>,
    },
    Deregister {
        user: Arc<User>,
    },
    Route {
        message: Message,
    },
    Connected {
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct Connected {
    user: Arc<User>,
    observer: Arc<dyn Observer>,
}

/// Loop state. Consumed by [`Chat::start`].
pub struct Chat {
    registry: HashMap<String, Connected>,
    host: String,
    mailbox_capacity: usize,
    executor: Arc<dyn Executor>,
    router: Arc<MessageRouter>,
    status: Arc<StatusManager>,
    errors: Arc<ErrorDispatcher>,
    multiplexer: Arc<dyn Multiplexer>,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
}

impl Chat {
    pub fn new(config: &ChatConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            repository,
            bus,
            groups,
            offline,
            executor,
            multiplexer,
            reader,
            writer,
        } = collaborators;
        Self {
            registry: HashMap::new(),
            host: config.host.clone(),
            mailbox_capacity: config.mailbox_capacity.max(1),
            executor,
            router: Arc::new(MessageRouter::new(repository.clone(), groups, offline)),
            status: Arc::new(StatusManager::new(
                repository,
                bus.clone(),
                &config.presence_topic,
            )),
            errors: Arc::new(ErrorDispatcher::new(bus, &config.error_topic)),
            multiplexer,
            reader,
            writer,
        }
    }

    /// Spawns the dispatch loop on the current runtime. The loop runs until
    /// [`ChatHandle::stop`] is called.
    pub fn start(self) -> ChatHandle {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let handle = ChatHandle {
            tx,
            cancellation_token: CancellationToken::new(),
            executor: self.executor.clone(),
            errors: self.errors.clone(),
            multiplexer: self.multiplexer.clone(),
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        };
        let _join_handle = rt::spawn(self.run(handle.clone(), rx));
        handle
    }

    async fn run(mut self, handle: ChatHandle, mut rx: mpsc::Receiver<Command>) {
        tracing::info!(host = %self.host, "Dispatch loop started");
        let cancellation_token = handle.cancellation_token.clone();
        loop {
            let command = rt::select! {
                _ = cancellation_token.cancelled() => None,
                command = rx.recv() => command,
            };
            match command {
                Some(Command::Register { user, observer }) => {
                    self.register(user, observer, &handle)
                }
                Some(Command::Deregister { user }) => self.deregister(user),
                Some(Command::Route { message }) => self.route(message, &handle),
                Some(Command::Connected { reply }) => {
                    let _ = reply.send(self.registry.keys().cloned().collect());
                }
                None => break,
            }
        }

        cancellation_token.cancel();
        rx.close();
        for (_, connected) in self.registry.drain() {
            connected.observer.stop();
            connected.user.close();
        }
        tracing::info!(host = %self.host, "Dispatch loop stopped");
    }

    fn register(&mut self, user: Arc<User>, observer: Arc<dyn Observer>, handle: &ChatHandle) {
        let user_id = user.id().to_owned();
        tracing::debug!(user_id = %user_id, "User registered");
        let connected = Connected {
            user: user.clone(),
            observer,
        };
        if let Some(previous) = self.registry.insert(user_id.clone(), connected) {
            tracing::info!(user_id = %user_id, "Replacing existing connection");
            previous.observer.stop();
            previous.user.close();
        }

        let status = self.status.clone();
        let router = self.router.clone();
        let errors = self.errors.clone();
        let host = self.host.clone();
        let handle = handle.clone();
        // Not ordered against the OFFLINE job of a quick hang-up: that one may
        // run first and leave a stale ONLINE row behind.
        self.executor.schedule(job(move |_| async move {
            if let Err(e) = status.handle_status(&user_id, &host, UserStatus::Online).await {
                // the connection cannot be announced, so it is not kept
                user.close();
                if let Err(e) = handle.deregister(user).await {
                    tracing::debug!(user_id = %user_id, error = %e, "Deregistration after failed status skipped");
                }
                errors.send(e).await;
                return;
            }
            if let Err(e) = router.send_messages_offline(&user_id, &handle).await {
                errors.send(e).await;
            }
        }));
    }

    fn deregister(&mut self, user: Arc<User>) {
        let current = self
            .registry
            .get(user.id())
            .is_some_and(|connected| Arc::ptr_eq(&connected.user, &user));
        if !current {
            tracing::debug!(user_id = %user.id(), "Ignoring stale deregistration");
            return;
        }
        if let Some(connected) = self.registry.remove(user.id()) {
            connected.observer.stop();
            connected.user.close();
        }
        tracing::debug!(user_id = %user.id(), "User deregistered");

        let status = self.status.clone();
        let errors = self.errors.clone();
        let host = self.host.clone();
        // May overtake this user's ONLINE job, see `register`.
        self.executor.schedule(job(move |_| async move {
            if let Err(e) = status.handle_status(user.id(), &host, UserStatus::Offline).await {
                errors.send(e).await;
            }
        }));
    }

    fn route(&self, message: Message, handle: &ChatHandle) {
        let recipient = if message.is_group_message() {
            None
        } else {
            self.registry
                .get(message.to())
                .map(|connected| connected.user.clone())
        };

        let router = self.router.clone();
        let errors = self.errors.clone();
        let handle = handle.clone();
        self.executor.schedule(job(move |_| async move {
            if let Some(user) = recipient {
                match router.is_blocked(&message).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        errors.send(e).await;
                        return;
                    }
                }
                match user.write_message(&message).await {
                    Ok(()) => {
                        tracing::trace!(user_id = %user.id(), message_id = %message.id(), "Delivered");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user.id(), message_id = %message.id(), error = %e, "Direct delivery failed, falling back");
                        if e.is_connection_fatal() {
                            if let Err(e) = handle.deregister(user).await {
                                tracing::debug!(error = %e, "Deregistration after failed write skipped");
                            }
                        }
                    }
                }
            }
            if let Err(e) = router.handle_message(message).await {
                errors.send(e).await;
            }
        }));
    }
}

/// Cloneable entry point to a running dispatch loop.
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::Sender<Command>,
    cancellation_token: CancellationToken,
    executor: Arc<dyn Executor>,
    errors: Arc<ErrorDispatcher>,
    multiplexer: Arc<dyn Multiplexer>,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
}

impl std::fmt::Debug for ChatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHandle")
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl ChatHandle {
    /// Hands an authenticated connection to the loop and starts watching it.
    /// Waits until the loop has accepted the user.
    pub async fn register(&self, user_id: &str, conn: TcpStream) -> Result<(), ChatError> {
        self.ensure_accepting()?;
        let conn = Arc::new(conn);
        let user = Arc::new(User::new(
            user_id,
            conn.clone(),
            self.reader.as_ref(),
            self.writer.clone(),
        ));
        let observer = self.multiplexer.observable_read(&conn)?;

        self.send(Command::Register {
            user: user.clone(),
            observer: observer.clone(),
        })
        .await?;

        // started only once the loop knows the user, so a hang-up can never
        // overtake the registration
        if let Err(e) = observer.start(self.watch(user.clone(), observer.clone())) {
            let _ = self.deregister(user).await;
            return Err(e);
        }
        Ok(())
    }

    /// Queues `message` for routing. This is how every component, local or
    /// remote, injects traffic.
    pub async fn send_message(&self, message: Message) -> Result<(), ChatError> {
        self.ensure_accepting()?;
        self.send(Command::Route { message }).await
    }

    /// Ids currently in the registry.
    pub async fn connected_users(&self) -> Result<Vec<String>, ChatError> {
        self.ensure_accepting()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connected { reply }).await?;
        match rt::timeout(DEFAULT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(users)) => Ok(users),
            Ok(Err(_)) => Err(ChatError::ClosedChannel),
            Err(_) => Err(ChatError::Timeout),
        }
    }

    pub fn is_accepting(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Stops the dispatch loop. Registered connections are closed and later
    /// calls fail with [`ChatError::ClosedChannel`].
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    async fn deregister(&self, user: Arc<User>) -> Result<(), ChatError> {
        self.send(Command::Deregister { user }).await
    }

    async fn send(&self, command: Command) -> Result<(), ChatError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ChatError::ClosedChannel)
    }

    fn ensure_accepting(&self) -> Result<(), ChatError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(ChatError::ClosedChannel)
        }
    }

    fn watch(&self, user: Arc<User>, observer: Arc<dyn Observer>) -> ReadinessCallback {
        let handle = self.clone();
        Box::new(move |readiness| handle.schedule_receive(user.clone(), observer.clone(), readiness))
    }

    fn schedule_receive(&self, user: Arc<User>, observer: Arc<dyn Observer>, readiness: Readiness) {
        let handle = self.clone();
        self.executor.schedule(job(move |_| async move {
            handle.on_readiness(user, observer, readiness).await
        }));
    }

    async fn on_readiness(&self, user: Arc<User>, observer: Arc<dyn Observer>, readiness: Readiness) {
        if readiness.closed || readiness.error.is_some() {
            observer.stop();
            if readiness.error.is_none() {
                // frames sent right before the hang-up are still delivered
                for received in user.drain().await {
                    match received {
                        Ok(message) => {
                            if let Err(e) = self.forward(&user, message).await {
                                tracing::debug!(user_id = %user.id(), error = %e, "Acknowledgement after hang-up not written");
                            }
                        }
                        Err(e) => self.errors.send(e).await,
                    }
                }
            }
            user.close();
            if let Err(e) = self.deregister(user.clone()).await {
                tracing::debug!(user_id = %user.id(), error = %e, "Deregistration after hang-up skipped");
            }
            match readiness.error {
                Some(error) => self.errors.send(error.into()).await,
                None => tracing::debug!(user_id = %user.id(), "Peer hung up"),
            }
            return;
        }

        let fatal = match user.receive().await {
            Ok(Some(message)) => match self.forward(&user, message).await {
                Err(e) if e.is_connection_fatal() => Some(e),
                Err(e) => {
                    self.errors.send(e).await;
                    None
                }
                Ok(()) => None,
            },
            Ok(None) => None,
            Err(e) if e.is_connection_fatal() => Some(e),
            Err(e) => {
                self.errors.send(e).await;
                None
            }
        };
        let fatal = match fatal {
            None if user.is_closed() => Some(TransportError::Closed.into()),
            fatal => fatal,
        };
        if let Some(e) = fatal {
            observer.stop();
            if let Err(e) = self.deregister(user.clone()).await {
                tracing::debug!(user_id = %user.id(), error = %e, "Deregistration after connection failure skipped");
            }
            self.errors.send(e).await;
            return;
        }

        if user.has_buffered_input().await {
            self.schedule_receive(user, observer, Readiness::default());
        } else {
            observer.resume();
        }
    }

    /// Hands a message received on `user`'s connection to the loop and
    /// acknowledges it. A failed hand-off is reported here; a failed
    /// acknowledgement is returned.
    async fn forward(&self, user: &User, message: Message) -> Result<(), ChatError> {
        let message_id = message.id().to_owned();
        if let Err(e) = self.send_message(message).await {
            self.errors.send(e).await;
            return Ok(());
        }
        user.write_ack(&message_id).await
    }
}
