//! Relay server demonstrating the delivery core over plain TCP.
//!
//! Each client sends its user id on the first line, then exchanges
//! newline-delimited JSON messages:
//!
//! ```text
//! $ nc 127.0.0.1 7070
//! alice
//! {"id":"1","from":"alice","to":"bob","date":"2024-05-01T12:00:00Z","content_type":"TEXT","content":"hi"}
//! ```
//!
//! The first line stands in for a real authentication layer.

mod groups;

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_chat::{
    Chat, ChatConfig, ChatHandle, Collaborators, Event, EventBus, Executor, LineFraming, LocalBus,
    MemoryRepository, TokioMultiplexer, WorkerPool,
};
use courier_rt::net::{TcpListener, TcpStream};
use courier_rt::{self as rt, init_tracing, CancellationToken, LogFormat};
use groups::LoggingGroups;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_USER_ID_LENGTH: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "relay_server", version, about = "Line-delimited JSON chat relay")]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept client connections on
    #[arg(long, default_value = "127.0.0.1:7070")]
    listen: String,

    /// Emit JSON logs instead of the pretty format
    #[arg(long, env = "COURIER_JSON_LOGS")]
    json_logs: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    // installed first, so the pretty subscriber of `rt::run` is skipped
    if args.json_logs {
        init_tracing(LogFormat::Json);
    }
    let config = ChatConfig::load(args.config.as_deref())?;
    rt::run(serve(args.listen, config))?
}

async fn serve(listen: String, config: ChatConfig) -> Result<(), Box<dyn Error>> {
    let repository = Arc::new(MemoryRepository::new());
    let bus = Arc::new(LocalBus::new());
    let executor = Arc::new(WorkerPool::start(config.workers));
    let framing = Arc::new(LineFraming::new(config.max_frame_length));
    let chat = Chat::new(
        &config,
        Collaborators {
            repository: repository.clone(),
            bus: bus.clone(),
            groups: Arc::new(LoggingGroups),
            offline: repository,
            executor: executor.clone(),
            multiplexer: Arc::new(TokioMultiplexer::current()?),
            reader: framing.clone(),
            writer: framing,
        },
    )
    .start();

    let subscriptions = CancellationToken::new();
    bus.subscribe(
        subscriptions.clone(),
        "relay_server",
        &config.presence_topic,
        Arc::new(|event: Event| {
            tracing::info!(user_id = %event.key, event = %String::from_utf8_lossy(&event.value), "Presence");
        }),
    )
    .await?;

    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(address = %listen, host = %config.host, "Relay server listening");

    loop {
        rt::select! {
            _ = rt::signal::ctrl_c() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Connection accepted");
                    let _join_handle = rt::spawn(handshake(chat.clone(), stream));
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
        }
    }

    tracing::info!("Shutting down");
    chat.stop();
    subscriptions.cancel();
    executor.shutdown();
    bus.close();
    Ok(())
}

async fn handshake(chat: ChatHandle, stream: TcpStream) {
    let user_id = match rt::timeout(HANDSHAKE_TIMEOUT, read_user_id(&stream)).await {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!("Handshake timed out");
            return;
        }
    };
    if let Err(e) = chat.register(&user_id, stream).await {
        tracing::warn!(user_id = %user_id, error = %e, "Registration failed");
    }
}

/// Reads the first line byte by byte, so no message frame that follows it is
/// consumed before the connection is handed over.
async fn read_user_id(stream: &TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.readable().await?;
        match stream.try_read(&mut byte) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) if line.len() >= MAX_USER_ID_LENGTH => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "user id too long"));
            }
            Ok(_) => line.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    let line = String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let user_id = line.trim();
    if user_id.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty user id"));
    }
    Ok(user_id.to_owned())
}
