//! Connection handle of a registered user.
//!
//! All reads and writes on one connection are serialized by the handle's own
//! io-mutex; different connections never share a lock. Any read, decode or
//! write failure closes the connection and is returned as a fatal
//! [`ChatError::Transport`], after which callers must deregister the user.
//!
//! Closing is logical: [`User::close`] makes every later read and write fail,
//! but the socket is shared with the observer and in-flight jobs, so the
//! peer only sees a FIN once the last `Arc<TcpStream>` is dropped. For a
//! deregistered user that happens when its observer task and pending jobs
//! finish.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use courier_rt::net::TcpStream;
use courier_rt::sync::Mutex;

use crate::error::{ChatError, TransportError};
use crate::framing::{Frame, FrameDecoder, Reader, Writer};
use crate::message::{ContentType, Message};

const READ_CHUNK: usize = 4 * 1024;

struct Io {
    decoder: Box<dyn FrameDecoder>,
    inbound: BytesMut,
    outbound: BytesMut,
    /// The last read produced a frame and left bytes behind.
    more: bool,
}

enum Received {
    Message(Message),
    /// Control frame or rejected envelope, already answered.
    Skipped,
    /// No complete frame buffered yet.
    Pending,
}

pub struct User {
    id: String,
    conn: Arc<TcpStream>,
    writer: Arc<dyn Writer>,
    io: Mutex<Io>,
    closed: AtomicBool,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl User {
    pub fn new(
        id: impl Into<String>,
        conn: Arc<TcpStream>,
        reader: &dyn Reader,
        writer: Arc<dyn Writer>,
    ) -> Self {
        Self {
            id: id.into(),
            conn,
            writer,
            io: Mutex::new(Io {
                decoder: reader.reader(),
                inbound: BytesMut::with_capacity(READ_CHUNK),
                outbound: BytesMut::new(),
                more: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Authenticated identity of the connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<TcpStream> {
        &self.conn
    }

    /// Reads and decodes the next message without waiting for the socket.
    ///
    /// Returns `Ok(None)` when no complete frame is available yet, for
    /// transport control frames and for envelopes that
    /// failed validation (those are answered with an `ERROR` frame). An
    /// envelope whose sender differs from [`User::id`] is answered the same
    /// way and reported as [`ChatError::Spoofing`]; the connection stays open
    /// in both cases unless the answer could not be written.
    pub async fn receive(&self) -> Result<Option<Message>, ChatError> {
        self.ensure_open()?;
        let mut io = self.io.lock().await;
        match self.next_message(&mut io).await? {
            Received::Message(message) => Ok(Some(message)),
            Received::Skipped | Received::Pending if self.is_closed() => {
                Err(TransportError::Closed.into())
            }
            Received::Skipped | Received::Pending => Ok(None),
        }
    }

    /// Decodes everything the peer sent before hanging up. Invalid, spoofed
    /// and control frames do not stop the drain; it ends at end of stream,
    /// when the buffer runs dry or at the first transport failure. Answers to
    /// rejected frames are still attempted.
    pub async fn drain(&self) -> Vec<Result<Message, ChatError>> {
        let mut io = self.io.lock().await;
        let mut drained = Vec::new();
        loop {
            match self.next_message(&mut io).await {
                Ok(Received::Message(message)) => drained.push(Ok(message)),
                Ok(Received::Skipped) => {}
                Ok(Received::Pending) => break,
                Err(ChatError::Transport(TransportError::Closed)) => break,
                Err(e) if e.is_connection_fatal() => {
                    drained.push(Err(e));
                    break;
                }
                Err(e) => drained.push(Err(e)),
            }
        }
        tracing::debug!(user_id = %self.id, count = drained.len(), "Drained connection after hang-up");
        drained
    }

    pub async fn write_message(&self, message: &Message) -> Result<(), ChatError> {
        self.ensure_open()?;
        let mut io = self.io.lock().await;
        self.write_locked(&mut io, message).await
    }

    pub async fn write_response(
        &self,
        message_id: &str,
        content_type: ContentType,
        content: &str,
    ) -> Result<(), ChatError> {
        self.write_message(&Message::control(message_id, &self.id, content_type, content))
            .await
    }

    pub async fn write_ack(&self, message_id: &str) -> Result<(), ChatError> {
        self.write_message(&Message::ack(message_id, &self.id)).await
    }

    /// True when the last receive left bytes behind that may already hold
    /// another frame. The socket does not signal readiness for those again.
    pub async fn has_buffered_input(&self) -> bool {
        self.io.lock().await.more
    }

    /// Marks the connection dead. Does not shut the socket down; see the
    /// module docs.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(user_id = %self.id, "Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ChatError> {
        if self.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Ok(())
        }
    }

    /// One frame, validated. Read and decode failures close the connection;
    /// a failed answer to a rejected frame closes it too but keeps the
    /// rejection as the result.
    async fn next_message(&self, io: &mut Io) -> Result<Received, ChatError> {
        let frame = match self.read_frame(io) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Received::Pending),
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };
        let payload = match frame {
            Frame::Data(payload) => payload,
            Frame::Control => return Ok(Received::Skipped),
        };
        let message: Message = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.close();
                return Err(TransportError::Codec(e).into());
            }
        };

        if let Err(e) = message.validate() {
            tracing::debug!(user_id = %self.id, message_id = %message.id(), error = %e, "Rejected invalid message");
            self.answer(io, Message::error(message.id(), &self.id, e.to_string()))
                .await;
            return Ok(Received::Skipped);
        }

        if message.from() != self.id {
            let error = ChatError::Spoofing {
                connection: self.id.clone(),
                claimed: message.from().to_owned(),
            };
            tracing::warn!(user_id = %self.id, claimed = %message.from(), message_id = %message.id(), "Rejected spoofed message");
            self.answer(io, Message::error(message.id(), &self.id, error.to_string()))
                .await;
            return Err(error);
        }

        Ok(Received::Message(message))
    }

    async fn answer(&self, io: &mut Io, response: Message) {
        if let Err(e) = self.write_locked(io, &response).await {
            tracing::debug!(user_id = %self.id, message_id = %response.id(), error = %e, "Answer not written");
        }
    }

    /// Decodes from what is buffered, pulling from the socket until it would
    /// block. Never waits while the io-mutex is held.
    fn read_frame(&self, io: &mut Io) -> Result<Option<Frame>, TransportError> {
        let Io {
            decoder,
            inbound,
            more,
            ..
        } = io;
        loop {
            if let Some(frame) = decoder.decode(inbound)? {
                *more = !inbound.is_empty();
                return Ok(Some(frame));
            }
            inbound.reserve(READ_CHUNK);
            match self.conn.try_read_buf(&mut *inbound) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    *more = false;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_locked(&self, io: &mut Io, message: &Message) -> Result<(), ChatError> {
        let result = self.write_frame(io, message).await;
        if result.is_err() {
            self.close();
        }
        result.map_err(Into::into)
    }

    async fn write_frame(&self, io: &mut Io, message: &Message) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        io.outbound.clear();
        self.writer.write(&payload, &mut io.outbound)?;

        let mut written = 0;
        while written < io.outbound.len() {
            self.conn.writable().await?;
            match self.conn.try_write(&io.outbound[written..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::LineFraming;
    use courier_rt::net::TcpListener;
    use courier_rt::Runtime;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn pair(id: &str) -> (User, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let framing = Arc::new(LineFraming::default());
        let user = User::new(id, Arc::new(server), framing.as_ref(), framing.clone());
        (user, client)
    }

    /// Waits for the socket, then receives, as a readiness job would.
    async fn next(user: &User) -> Result<Option<Message>, ChatError> {
        user.connection().readable().await.unwrap();
        user.receive().await
    }

    async fn read_message(client: &mut BufReader<TcpStream>) -> Message {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn receives_a_message_from_its_owner() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, mut client) = pair("alice").await;
            let sent = Message::new("alice", "bob", "", "TEXT", "hi").unwrap();
            let mut line = serde_json::to_vec(&sent).unwrap();
            line.push(b'\n');
            client.write_all(&line).await.unwrap();

            let received = next(&user).await.unwrap();
            assert_eq!(received, Some(sent));
            assert!(!user.has_buffered_input().await);
        })
    }

    #[test]
    fn rejects_spoofed_sender_with_error_frame() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, client) = pair("alice").await;
            let mut client = BufReader::new(client);
            let spoofed = Message::new("mallory", "bob", "", "TEXT", "hi").unwrap();
            let mut line = serde_json::to_vec(&spoofed).unwrap();
            line.push(b'\n');
            client.get_mut().write_all(&line).await.unwrap();

            let result = next(&user).await;
            assert!(matches!(result, Err(ChatError::Spoofing { .. })));
            assert!(!result.unwrap_err().is_connection_fatal());
            assert!(!user.is_closed());

            let response = read_message(&mut client).await;
            assert_eq!(response.id(), spoofed.id());
            assert_eq!(response.content_type(), "ERROR");
        })
    }

    #[test]
    fn answers_invalid_message_and_stays_open() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, client) = pair("alice").await;
            let mut client = BufReader::new(client);
            let invalid = json!({ "id": "m-1", "from": "alice", "to": "bob" }).to_string();
            client
                .get_mut()
                .write_all(format!("{invalid}\n\n").as_bytes())
                .await
                .unwrap();

            assert_eq!(next(&user).await.unwrap(), None);
            let response = read_message(&mut client).await;
            assert_eq!(response.id(), "m-1");
            assert_eq!(response.content(), "message date is required");

            // keep-alive line
            assert!(user.has_buffered_input().await);
            assert_eq!(user.receive().await.unwrap(), None);
            assert!(!user.is_closed());
        })
    }

    #[test]
    fn drain_keeps_going_past_rejected_frames() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, client) = pair("alice").await;
            let mut client = BufReader::new(client);
            let first = Message::new("alice", "bob", "", "TEXT", "one").unwrap();
            let spoofed = Message::new("mallory", "bob", "", "TEXT", "two").unwrap();
            let last = Message::new("alice", "carol", "", "TEXT", "three").unwrap();
            let invalid = json!({ "id": "m-1", "from": "alice", "to": "bob" }).to_string();
            let mut frames = format!("{invalid}\n\n").into_bytes();
            for message in [&first, &spoofed, &last] {
                frames.extend(serde_json::to_vec(message).unwrap());
                frames.push(b'\n');
            }
            client.get_mut().write_all(&frames).await.unwrap();
            client.get_mut().shutdown().await.unwrap();

            user.connection().readable().await.unwrap();
            let drained = user.drain().await;
            assert_eq!(drained.len(), 3);
            assert_eq!(drained[0].as_ref().unwrap(), &first);
            assert!(matches!(drained[1], Err(ChatError::Spoofing { .. })));
            assert_eq!(drained[2].as_ref().unwrap(), &last);

            assert_eq!(read_message(&mut client).await.id(), "m-1");
            assert_eq!(read_message(&mut client).await.id(), spoofed.id());
        })
    }

    #[test]
    fn undecodable_payload_closes_connection() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, mut client) = pair("alice").await;
            client.write_all(b"not json\n").await.unwrap();

            let error = next(&user).await.unwrap_err();
            assert!(error.is_connection_fatal());
            assert!(user.is_closed());
            assert!(user.write_ack("x").await.is_err());
        })
    }

    #[test]
    fn hang_up_is_a_transport_error() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, client) = pair("alice").await;
            drop(client);

            let error = next(&user).await.unwrap_err();
            assert!(matches!(
                error,
                ChatError::Transport(TransportError::Closed)
                    | ChatError::Transport(TransportError::Io(_))
            ));
        })
    }

    #[test]
    fn writes_control_frames() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async move {
            let (user, client) = pair("alice").await;
            let mut client = BufReader::new(client);

            user.write_ack("m-7").await.unwrap();
            user.write_response("m-8", ContentType::ERROR, "nope")
                .await
                .unwrap();

            let ack = read_message(&mut client).await;
            assert_eq!((ack.id(), ack.content_type(), ack.content()), ("m-7", "ACK", "sent"));
            let error = read_message(&mut client).await;
            assert_eq!((error.id(), error.content_type(), error.content()), ("m-8", "ERROR", "nope"));
            assert_eq!(error.to(), "alice");
        })
    }
}
