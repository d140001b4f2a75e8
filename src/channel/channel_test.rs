use serde_json::json;

use super::*;

#[test]
fn test_method_id_round_trip() {
    let methods = [
        MethodId::PeerClose,
        MethodId::PeerDump,
        MethodId::PeerSetCapabilities,
        MethodId::PeerCreateTransport,
        MethodId::PeerCreateProducer,
        MethodId::TransportClose,
        MethodId::TransportDump,
        MethodId::TransportSetRemoteDtlsParameters,
        MethodId::TransportSetMaxBitrate,
        MethodId::TransportChangeUfragPwd,
        MethodId::ProducerClose,
        MethodId::ProducerDump,
        MethodId::ProducerReceive,
        MethodId::ProducerSetRtpRawEvent,
        MethodId::ProducerSetRtpObjectEvent,
        MethodId::ProducerSetTransport,
        MethodId::ConsumerDump,
        MethodId::ConsumerSetTransport,
        MethodId::ConsumerDisable,
    ];

    for method in methods {
        assert_eq!(MethodId::from_method(method.as_method()), Some(method));
    }

    assert_eq!(MethodId::from_method("room.close"), None);
}

#[test]
fn test_internal_id_parsing() {
    let request = Request::new(
        MethodId::TransportDump,
        json!({"transportId": 10, "producerId": "nope", "consumerId": -1}),
        json!({}),
    );

    assert_eq!(request.internal_u32("transportId"), Some(10));
    assert_eq!(request.internal_u32("producerId"), None);
    assert_eq!(request.internal_u32("consumerId"), None);
    assert_eq!(request.internal_u32("peerId"), None);

    let request = Request::new(
        MethodId::TransportDump,
        json!({"transportId": u64::from(u32::MAX) + 1}),
        json!({}),
    );
    assert_eq!(request.internal_u32("transportId"), None);
}

#[tokio::test]
async fn test_notifier_delivery() {
    let (notifier, mut rx) = ChannelNotifier::new();

    notifier.emit(7, "close", json!({"class": "Peer"}));

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.target_id, 7);
    assert_eq!(notification.event, "close");
    assert_eq!(notification.data["class"], "Peer");

    // A dropped receiver must not make emitters fail.
    drop(rx);
    notifier.emit(7, "close", json!({"class": "Peer"}));
}
