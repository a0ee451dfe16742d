mod config;

pub use self::config::{Settings, KeyAlgorithm, load_config};
