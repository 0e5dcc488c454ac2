use thiserror::Error;

use tilebind_protocol::TrackId;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No attendee known for track {track_id}")]
    UnknownAttendee { track_id: TrackId },

    #[error("Track {track_id} never reported its dimensions after {attempts} attempts")]
    CapabilityExhausted { track_id: TrackId, attempts: u32 },

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, BindingError>;
