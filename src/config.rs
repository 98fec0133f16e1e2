//! Configuration for fabric-bridge.
//!
//! Per-call option structs (`ConnectOptions`, `SubscriptionOptions`, ...)
//! live in [`options`]; the TOML settings file and its location in
//! [`settings`] and [`user`].

pub mod options;
pub mod settings;
pub mod user;

pub use options::{AckMode, ConnectOptions, ReplayOptions, SendOptions, SubscriptionOptions};
pub use settings::{
    BridgeSettings, ConfigError, ConfigResult, ConnectionSettings, GdSettings, HostSettings,
    split_tmx,
};
pub use user::{load_user_config, user_config_path};
