#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Per-participant control core of an SFU worker.
//!
//! The subject is the [`peer::Peer`]: it owns a participant's
//! [`transport::Transport`]s, [`producer::Producer`]s (ingress RTP) and
//! [`consumer::Consumer`]s (egress RTP), dispatches control-plane requests
//! addressed to any of them, demultiplexes incoming RTCP feedback by SSRC,
//! and drives the participant's outgoing RTCP on a bandwidth-adapted,
//! randomly jittered interval.
//!
//! The ICE/DTLS/SRTP machinery, the media internals of the streams, and the
//! enclosing Room are collaborators behind seams: [`transport::RtcpWriter`]
//! for the wire, [`peer::PeerListener`] for the Room.

pub mod channel;
pub mod compound_packet;
pub mod consumer;
pub mod error;
pub mod peer;
pub mod producer;
pub mod rtp_parameters;
pub mod transport;

pub use error::{Error, Result};
