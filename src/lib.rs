pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod hub_client;
pub mod probe_server;
pub mod rapp;
pub mod session;
pub mod state;
pub mod wire;
pub mod zones;

pub use config::Config;
pub use error::{CoreError, FrameError, SessionError};
pub use hub_client::HubClient;
pub use state::SharedState;
