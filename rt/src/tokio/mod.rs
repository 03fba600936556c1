//! Tokio reexports, so the delivery core never names tokio directly
pub mod mpsc;

pub mod oneshot {
    pub use tokio::sync::oneshot::{channel, Receiver, Sender};
}

pub mod sync {
    pub use tokio::sync::{broadcast, Mutex, Notify};
}

pub mod net {
    pub use tokio::io::Interest;
    pub use tokio::net::{TcpListener, TcpStream};
}

pub mod codec {
    pub use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
}

pub use tokio::{
    runtime::{Handle, Runtime},
    select, signal,
    task::{spawn, JoinHandle},
    time::{sleep, timeout},
};
pub use tokio_util::sync::CancellationToken;
