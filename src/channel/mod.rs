#[cfg(test)]
mod channel_test;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

/// Identifier of a control-plane request method addressed to a Peer or to one
/// of its owned entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodId {
    PeerClose,
    PeerDump,
    PeerSetCapabilities,
    PeerCreateTransport,
    PeerCreateProducer,
    TransportClose,
    TransportDump,
    TransportSetRemoteDtlsParameters,
    TransportSetMaxBitrate,
    TransportChangeUfragPwd,
    ProducerClose,
    ProducerDump,
    ProducerReceive,
    ProducerSetRtpRawEvent,
    ProducerSetRtpObjectEvent,
    ProducerSetTransport,
    ConsumerDump,
    ConsumerSetTransport,
    ConsumerDisable,
}

impl MethodId {
    /// Maps the wire method name to its id. Unknown names yield `None`; the
    /// dispatcher rejects those with "unknown method".
    pub fn from_method(method: &str) -> Option<Self> {
        Some(match method {
            "peer.close" => MethodId::PeerClose,
            "peer.dump" => MethodId::PeerDump,
            "peer.setCapabilities" => MethodId::PeerSetCapabilities,
            "peer.createTransport" => MethodId::PeerCreateTransport,
            "peer.createProducer" => MethodId::PeerCreateProducer,
            "transport.close" => MethodId::TransportClose,
            "transport.dump" => MethodId::TransportDump,
            "transport.setRemoteDtlsParameters" => MethodId::TransportSetRemoteDtlsParameters,
            "transport.setMaxBitrate" => MethodId::TransportSetMaxBitrate,
            "transport.changeUfragPwd" => MethodId::TransportChangeUfragPwd,
            "producer.close" => MethodId::ProducerClose,
            "producer.dump" => MethodId::ProducerDump,
            "producer.receive" => MethodId::ProducerReceive,
            "producer.setRtpRawEvent" => MethodId::ProducerSetRtpRawEvent,
            "producer.setRtpObjectEvent" => MethodId::ProducerSetRtpObjectEvent,
            "producer.setTransport" => MethodId::ProducerSetTransport,
            "consumer.dump" => MethodId::ConsumerDump,
            "consumer.setTransport" => MethodId::ConsumerSetTransport,
            "consumer.disable" => MethodId::ConsumerDisable,
            _ => return None,
        })
    }

    pub fn as_method(&self) -> &'static str {
        match self {
            MethodId::PeerClose => "peer.close",
            MethodId::PeerDump => "peer.dump",
            MethodId::PeerSetCapabilities => "peer.setCapabilities",
            MethodId::PeerCreateTransport => "peer.createTransport",
            MethodId::PeerCreateProducer => "peer.createProducer",
            MethodId::TransportClose => "transport.close",
            MethodId::TransportDump => "transport.dump",
            MethodId::TransportSetRemoteDtlsParameters => "transport.setRemoteDtlsParameters",
            MethodId::TransportSetMaxBitrate => "transport.setMaxBitrate",
            MethodId::TransportChangeUfragPwd => "transport.changeUfragPwd",
            MethodId::ProducerClose => "producer.close",
            MethodId::ProducerDump => "producer.dump",
            MethodId::ProducerReceive => "producer.receive",
            MethodId::ProducerSetRtpRawEvent => "producer.setRtpRawEvent",
            MethodId::ProducerSetRtpObjectEvent => "producer.setRtpObjectEvent",
            MethodId::ProducerSetTransport => "producer.setTransport",
            MethodId::ConsumerDump => "consumer.dump",
            MethodId::ConsumerSetTransport => "consumer.setTransport",
            MethodId::ConsumerDisable => "consumer.disable",
        }
    }
}

/// A control-plane request.
///
/// `internal` carries routing ids (`transportId`, `producerId`, `consumerId`)
/// set by the server layer; `data` carries the method-specific payload. The
/// dispatcher answers every request exactly once: `Ok(Some(value))` or
/// `Ok(None)` accepts, `Err` rejects with the error's display text.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: MethodId,
    pub internal: Value,
    pub data: Value,
}

impl Request {
    pub fn new(method: MethodId, internal: Value, data: Value) -> Self {
        Request {
            method,
            internal,
            data,
        }
    }

    /// Reads an unsigned 32-bit id from `internal`. Anything else (absent,
    /// negative, fractional, out of range, non-numeric) yields `None`.
    pub(crate) fn internal_u32(&self, key: &str) -> Option<u32> {
        self.internal
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
    }
}

/// An event emitted by an entity toward the server layer.
#[derive(Debug, Clone)]
pub struct Notification {
    pub target_id: u32,
    pub event: String,
    pub data: Value,
}

/// Fan-out point for entity notifications.
///
/// Entities emit fire-and-forget events (`"close"`, `"newconsumer"`, ...)
/// through this; the server layer drains the receiving half and forwards them
/// to the signaling connection.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelNotifier { tx }), rx)
    }

    pub fn emit(&self, target_id: u32, event: &str, data: Value) {
        let notification = Notification {
            target_id,
            event: event.to_owned(),
            data,
        };
        if self.tx.send(notification).is_err() {
            log::warn!(
                "notification channel closed, dropping \"{}\" event [targetId:{}]",
                event,
                target_id
            );
        }
    }
}
