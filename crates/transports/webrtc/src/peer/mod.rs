//! Peer connection management

pub mod connection;

pub use connection::WebRtcMediaEngine;
