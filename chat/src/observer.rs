//! Read-readiness notifications for registered sockets.
//!
//! The OS level polling is done by the runtime's reactor (epoll/kqueue); this
//! module only adapts it to a start/stop observer. Callbacks run on the
//! observer's I/O task and must only enqueue work, never perform it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_rt::net::{Interest, TcpStream};
use courier_rt::sync::Notify;
use courier_rt::{self as rt, CancellationToken, Handle};

use crate::error::ChatError;

/// What the observer saw on the socket.
#[derive(Debug, Default)]
pub struct Readiness {
    /// The peer hung up or shut down its write half.
    pub closed: bool,
    pub error: Option<io::Error>,
}

pub type ReadinessCallback = Box<dyn Fn(Readiness) + Send + Sync>;

pub trait Observer: Send + Sync {
    /// Starts watching. The callback fires once per readiness event, after
    /// which the observer waits for [`Observer::resume`] before watching again.
    /// Watching ends after a `closed` or error notification.
    fn start(&self, callback: ReadinessCallback) -> Result<(), ChatError>;

    /// Re-arms the observer once the previous notification was handled.
    fn resume(&self);

    fn stop(&self);
}

pub trait Multiplexer: Send + Sync {
    fn observable_read(&self, conn: &Arc<TcpStream>) -> Result<Arc<dyn Observer>, ChatError>;
}

/// Multiplexer backed by the tokio reactor. Every watched socket costs one
/// lightweight task, never a thread.
#[derive(Debug, Clone)]
pub struct TokioMultiplexer {
    handle: Handle,
}

impl TokioMultiplexer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self, ChatError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ChatError::Observer(e.to_string()))
    }
}

impl Multiplexer for TokioMultiplexer {
    fn observable_read(&self, conn: &Arc<TcpStream>) -> Result<Arc<dyn Observer>, ChatError> {
        Ok(Arc::new(ReadObserver {
            conn: conn.clone(),
            handle: self.handle.clone(),
            cancellation_token: CancellationToken::new(),
            rearm: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }))
    }
}

struct ReadObserver {
    conn: Arc<TcpStream>,
    handle: Handle,
    cancellation_token: CancellationToken,
    rearm: Arc<Notify>,
    started: AtomicBool,
}

impl Observer for ReadObserver {
    fn start(&self, callback: ReadinessCallback) -> Result<(), ChatError> {
        if self.cancellation_token.is_cancelled() {
            return Err(ChatError::Observer("observer already stopped".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChatError::Observer("observer already started".into()));
        }

        let conn = self.conn.clone();
        let rearm = self.rearm.clone();
        let cancellation_token = self.cancellation_token.clone();
        self.handle.spawn(async move {
            loop {
                let ready = rt::select! {
                    _ = cancellation_token.cancelled() => break,
                    ready = conn.ready(Interest::READABLE) => ready,
                };
                match ready {
                    Ok(ready) => {
                        let closed = ready.is_read_closed();
                        callback(Readiness {
                            closed,
                            error: None,
                        });
                        if closed {
                            break;
                        }
                    }
                    Err(error) => {
                        callback(Readiness {
                            closed: false,
                            error: Some(error),
                        });
                        break;
                    }
                }
                rt::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = rearm.notified() => {}
                }
            }
            tracing::trace!("Observer finished");
        });
        Ok(())
    }

    fn resume(&self) {
        self.rearm.notify_one();
    }

    fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_rt::net::TcpListener;
    use courier_rt::{mpsc, Runtime};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn pair() -> (Arc<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(server), client)
    }

    fn forward(tx: mpsc::UnboundedSender<Readiness>) -> ReadinessCallback {
        Box::new(move |readiness| {
            let _ = tx.send(readiness);
        })
    }

    #[test]
    fn notifies_once_until_resumed() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (server, mut client) = pair().await;
            let observer = TokioMultiplexer::current()
                .unwrap()
                .observable_read(&server)
                .unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            observer.start(forward(tx)).unwrap();

            client.write_all(b"hello\n").await.unwrap();
            let first = rt::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(!first.closed);
            assert!(first.error.is_none());

            // data is still unread, but nothing fires until resumed
            assert!(rt::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err());

            observer.resume();
            let again = rt::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(!again.closed);
            observer.stop();
        })
    }

    #[test]
    fn reports_hang_up() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (server, client) = pair().await;
            let observer = TokioMultiplexer::current()
                .unwrap()
                .observable_read(&server)
                .unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            observer.start(forward(tx)).unwrap();

            drop(client);
            let readiness = rt::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(readiness.closed);
        })
    }

    #[test]
    fn cannot_start_twice_or_after_stop() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (server, _client) = pair().await;
            let multiplexer = TokioMultiplexer::current().unwrap();

            let observer = multiplexer.observable_read(&server).unwrap();
            observer.start(Box::new(|_| {})).unwrap();
            assert!(observer.start(Box::new(|_| {})).is_err());

            let stopped = multiplexer.observable_read(&server).unwrap();
            stopped.stop();
            assert!(stopped.start(Box::new(|_| {})).is_err());
        })
    }
}
