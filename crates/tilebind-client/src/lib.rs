//! Tilebind host side
//!
//! Connects the binding core in `tilebind-media` to a real webrtc-rs peer
//! connection and finds the binding configuration on disk.

pub mod settings;
pub mod webrtc_transport;

pub use settings::{binding_config_path, load_binding_config};
pub use webrtc_transport::{WebRtcStream, WebRtcTrack, WebRtcTransport, parse_attendee_id};
