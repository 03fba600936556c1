use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::framing::DEFAULT_MAX_FRAME_LENGTH;

/// Environment variables with this prefix override file settings,
/// e.g. `COURIER_WORKERS=32`.
pub const ENV_PREFIX: &str = "COURIER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Identity of this node, stored with every presence row.
    pub host: String,
    /// Worker pool size for background jobs.
    pub workers: usize,
    /// Capacity of the dispatch loop's command channel.
    pub mailbox_capacity: usize,
    /// Largest accepted frame, in bytes.
    pub max_frame_length: usize,
    pub presence_topic: String,
    pub error_topic: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            workers: 16,
            mailbox_capacity: 1,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            presence_topic: "chat.presence".to_owned(),
            error_topic: "chat.errors".to_owned(),
        }
    }
}

impl ChatConfig {
    /// Defaults, then the TOML file at `path` (if given), then `COURIER_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<figment::Error>> {
        let mut figment = Figment::from(Serialized::defaults(ChatConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)
    }
}
