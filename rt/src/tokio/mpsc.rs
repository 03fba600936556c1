//! Bounded and unbounded channels for the dispatch loop and worker pool

pub use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
