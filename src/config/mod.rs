// Configuration management module
// TOML settings under a base directory plus a read-only display helper

pub mod display;
pub mod settings;

pub use display::{render_config, show_config};
pub use settings::{
    Config, ConfigError, FeedbackConfig, HistoryConfig, IndexConfig, LlmConfig, OllamaConfig,
    WebConfig,
};
