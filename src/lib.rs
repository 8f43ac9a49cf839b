pub mod audio;
pub mod auth;
pub mod avatar;
mod client;
mod error;
pub mod reconnect;
pub mod sessions;
mod single_flight;
pub mod transport;
pub mod turn;

pub use agent_realtime_types as types;
pub use agent_realtime_utils as utils;
pub use client::{connect, connect_with_config, Client, ClientBuilder, ClientEvent, Config, ConfigBuilder, EventRx, Stats};
pub use error::{ClientError, ErrorKind, Recovery};
