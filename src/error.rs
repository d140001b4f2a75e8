use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while handling control-plane requests or assembling RTCP.
///
/// Request dispatch converts every failure into one of these; the `Display`
/// form is the reject reason sent back over the channel.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The request method is not addressed to a Peer or its entities.
    #[error("unknown method")]
    ErrUnknownMethod,

    /// PEER_SET_CAPABILITIES received twice.
    #[error("peer capabilities already set")]
    ErrCapabilitiesAlreadySet,

    /// An operation that requires capabilities ran before they were set.
    #[error("peer capabilities are not yet set")]
    ErrCapabilitiesNotSet,

    #[error("Transport already exists")]
    ErrTransportAlreadyExists,

    #[error("Transport does not exist")]
    ErrTransportNotFound,

    #[error("Producer already exists")]
    ErrProducerAlreadyExists,

    #[error("Producer does not exist")]
    ErrProducerNotFound,

    #[error("Consumer does not exist")]
    ErrConsumerNotFound,

    /// `internal.transportId` is absent or not an unsigned 32-bit integer.
    #[error("Request has not numeric internal.transportId")]
    ErrInvalidTransportId,

    /// `internal.producerId` is absent or not an unsigned 32-bit integer.
    #[error("Request has not numeric internal.producerId")]
    ErrInvalidProducerId,

    /// `internal.consumerId` is absent or not an unsigned 32-bit integer.
    #[error("Request has not numeric internal.consumerId")]
    ErrInvalidConsumerId,

    #[error("missing kind")]
    ErrMissingKind,

    #[error("invalid kind")]
    ErrInvalidKind,

    #[error("missing enabled")]
    ErrMissingEnabled,

    #[error("missing bitrate")]
    ErrMissingBitrate,

    /// A Producer was bound to a Transport before receiving RTP parameters.
    #[error("Producer has no RTP parameters")]
    ErrProducerNoRtpParameters,

    /// A serialized RTCP compound exceeds the fixed send buffer.
    #[error("RTCP compound packet too big ({0} bytes)")]
    ErrRtcpPacketTooBig(usize),

    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
    #[error("{0}")]
    Rtp(#[from] rtp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
