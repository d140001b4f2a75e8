use std::sync::Mutex as SyncMutex;

use bytes::Bytes;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::transport_feedbacks::transport_layer_nack::NackPair;
use serde_json::json;

use super::*;
use crate::channel::Notification;
use crate::transport::RtcpWriter;

#[derive(Debug, Clone, PartialEq)]
enum RoomEvent {
    PeerClosed(u32),
    Capabilities(u32),
    ProducerParameters(u32),
    ProducerClosed(u32),
    ConsumerClosed(u32),
    RtpPacket(u32),
    SenderReport { producer_id: u32, ssrc: u32 },
    ReceiverReport { consumer_id: u32, ssrc: u32 },
    Feedback(u32),
    FullFrameRequired(u32),
}

#[derive(Default)]
struct MockRoom {
    events: SyncMutex<Vec<RoomEvent>>,
    // Simulates the Room-side intersection with room-wide capabilities.
    reduce_to: SyncMutex<Option<RtpCapabilities>>,
    // A (peer, consumer, parameters) triple installed from within
    // on_peer_capabilities, the way the Room mirrors existing Producers.
    install_on_capabilities: SyncMutex<Option<(Weak<Peer>, Arc<Consumer>, RtpParameters)>>,
}

impl MockRoom {
    fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: RoomEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl PeerListener for MockRoom {
    async fn on_peer_closed(&self, peer_id: u32) {
        self.push(RoomEvent::PeerClosed(peer_id));
    }

    async fn on_peer_capabilities(&self, peer_id: u32, capabilities: &mut RtpCapabilities) {
        if let Some(reduced) = self.reduce_to.lock().unwrap().take() {
            *capabilities = reduced;
        }
        let install = self.install_on_capabilities.lock().unwrap().take();
        if let Some((peer, consumer, rtp_parameters)) = install {
            if let Some(peer) = peer.upgrade() {
                peer.add_consumer(&consumer, rtp_parameters, 900).await;
            }
        }
        self.push(RoomEvent::Capabilities(peer_id));
    }

    async fn on_peer_producer_parameters(&self, _peer_id: u32, producer: &Arc<Producer>) {
        self.push(RoomEvent::ProducerParameters(producer.id()));
    }

    async fn on_peer_producer_closed(&self, _peer_id: u32, producer: &Arc<Producer>) {
        self.push(RoomEvent::ProducerClosed(producer.id()));
    }

    async fn on_peer_consumer_closed(&self, _peer_id: u32, consumer: &Arc<Consumer>) {
        self.push(RoomEvent::ConsumerClosed(consumer.id()));
    }

    async fn on_peer_rtp_packet(
        &self,
        _peer_id: u32,
        producer: &Arc<Producer>,
        _packet: &rtp::packet::Packet,
    ) {
        self.push(RoomEvent::RtpPacket(producer.id()));
    }

    async fn on_peer_rtcp_sender_report(
        &self,
        _peer_id: u32,
        producer: &Arc<Producer>,
        report: &SenderReport,
    ) {
        self.push(RoomEvent::SenderReport {
            producer_id: producer.id(),
            ssrc: report.ssrc,
        });
    }

    async fn on_peer_rtcp_receiver_report(
        &self,
        _peer_id: u32,
        consumer: &Arc<Consumer>,
        report: &ReceptionReport,
    ) {
        self.push(RoomEvent::ReceiverReport {
            consumer_id: consumer.id(),
            ssrc: report.ssrc,
        });
    }

    async fn on_peer_rtcp_feedback(
        &self,
        _peer_id: u32,
        consumer: &Arc<Consumer>,
        _packet: Box<dyn rtcp::packet::Packet + Send + Sync>,
    ) {
        self.push(RoomEvent::Feedback(consumer.id()));
    }

    async fn on_full_frame_required(&self, _peer_id: u32, consumer: &Arc<Consumer>) {
        self.push(RoomEvent::FullFrameRequired(consumer.id()));
    }
}

struct TestContext {
    peer: Arc<Peer>,
    room: Arc<MockRoom>,
    notifier: Arc<ChannelNotifier>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl TestContext {
    fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            notifications.push(notification);
        }
        notifications
    }
}

fn setup() -> TestContext {
    let room = Arc::new(MockRoom::default());
    let room_dyn: Arc<dyn PeerListener> = room.clone();
    let listener: Weak<dyn PeerListener> = Arc::downgrade(&room_dyn);
    let (notifier, notifications) = ChannelNotifier::new();
    let peer = Peer::new(listener, Arc::clone(&notifier), 1, "alice".to_owned());

    TestContext {
        peer,
        room,
        notifier,
        notifications,
    }
}

fn request(method: MethodId, internal: Value, data: Value) -> Request {
    Request::new(method, internal, data)
}

fn audio_capabilities() -> Value {
    json!({
        "codecs": [
            {"kind": "audio", "name": "opus", "clockRate": 48000, "channels": 2}
        ]
    })
}

fn full_capabilities() -> Value {
    json!({
        "codecs": [
            {"kind": "audio", "name": "opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "name": "VP8", "clockRate": 90000}
        ],
        "headerExtensions": [
            {"kind": "video", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1}
        ]
    })
}

fn video_parameters(ssrc: u32) -> RtpParameters {
    serde_json::from_value(json!({
        "codecs": [{"name": "VP8", "payloadType": 101, "clockRate": 90000}],
        "encodings": [{"ssrc": ssrc, "codecPayloadType": 101}],
        "rtcp": {"cname": "alice@sfu"}
    }))
    .unwrap()
}

async fn set_capabilities(ctx: &TestContext) {
    let req = request(
        MethodId::PeerSetCapabilities,
        json!({}),
        full_capabilities(),
    );
    ctx.peer.handle_request(&req).await.unwrap();
}

async fn create_transport(ctx: &TestContext, transport_id: u32) {
    let req = request(
        MethodId::PeerCreateTransport,
        json!({ "transportId": transport_id }),
        json!({}),
    );
    ctx.peer.handle_request(&req).await.unwrap();
}

async fn create_producer(ctx: &TestContext, producer_id: u32, transport_id: u32, kind: &str) {
    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": producer_id, "transportId": transport_id }),
        json!({ "kind": kind }),
    );
    ctx.peer.handle_request(&req).await.unwrap();
}

async fn producer_receive(ctx: &TestContext, producer_id: u32, ssrc: u32) {
    let req = request(
        MethodId::ProducerReceive,
        json!({ "producerId": producer_id }),
        serde_json::to_value(video_parameters(ssrc)).unwrap(),
    );
    ctx.peer.handle_request(&req).await.unwrap();
}

fn new_consumer(ctx: &TestContext, consumer_id: u32, kind: MediaKind) -> Arc<Consumer> {
    let peer_dyn: Arc<dyn ConsumerListener> = ctx.peer.clone();
    let listener: Weak<dyn ConsumerListener> = Arc::downgrade(&peer_dyn);
    Consumer::new(listener, Arc::clone(&ctx.notifier), consumer_id, kind)
}

async fn add_consumer(ctx: &TestContext, consumer_id: u32, kind: MediaKind, ssrc: u32) {
    let consumer = new_consumer(ctx, consumer_id, kind);
    ctx.peer
        .add_consumer(&consumer, video_parameters(ssrc), 900)
        .await;
}

// S1: capabilities are set-once.
#[tokio::test]
async fn test_set_capabilities_once() {
    let ctx = setup();

    let req = request(
        MethodId::PeerSetCapabilities,
        json!({}),
        audio_capabilities(),
    );
    let reply = ctx.peer.handle_request(&req).await.unwrap().unwrap();
    assert_eq!(reply["codecs"][0]["name"], "opus");
    assert!(ctx.peer.has_capabilities());

    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "peer capabilities already set");
}

// S2: producers cannot exist before capabilities.
#[tokio::test]
async fn test_create_producer_requires_capabilities() {
    let ctx = setup();
    create_transport(&ctx, 10).await;

    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": 100, "transportId": 10 }),
        json!({ "kind": "video" }),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "peer capabilities are not yet set");
}

#[tokio::test]
async fn test_create_producer_validates_request() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;

    // Missing kind.
    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": 100, "transportId": 10 }),
        json!({}),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "missing kind");

    // Unknown kind.
    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": 100, "transportId": 10 }),
        json!({ "kind": "screen" }),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "invalid kind");

    // Unknown transport.
    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": 100, "transportId": 99 }),
        json!({ "kind": "video" }),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Transport does not exist");

    // Duplicate producer id.
    create_producer(&ctx, 100, 10, "video").await;
    let req = request(
        MethodId::PeerCreateProducer,
        json!({ "producerId": 100, "transportId": 10 }),
        json!({ "kind": "video" }),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Producer already exists");
}

#[tokio::test]
async fn test_create_transport_rejections() {
    let ctx = setup();
    create_transport(&ctx, 10).await;

    let req = request(
        MethodId::PeerCreateTransport,
        json!({ "transportId": 10 }),
        json!({}),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Transport already exists");

    let req = request(
        MethodId::PeerCreateTransport,
        json!({ "transportId": "ten" }),
        json!({}),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Request has not numeric internal.transportId"
    );
}

// S3 plus the REMB carry-over rule.
#[tokio::test]
async fn test_producer_set_transport_carries_remb() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    producer_receive(&ctx, 100, 7777).await;

    let previous = ctx.peer.get_transport(10).await.unwrap();
    previous.enable_remb();

    create_transport(&ctx, 11).await;

    let req = request(
        MethodId::ProducerSetTransport,
        json!({ "producerId": 100, "transportId": 11 }),
        json!({}),
    );
    ctx.peer.handle_request(&req).await.unwrap();

    let producer = ctx.peer.get_producer(100).await.unwrap();
    assert_eq!(producer.transport().await.unwrap().id(), 11);

    let target = ctx.peer.get_transport(11).await.unwrap();
    assert!(target.has_remb());
}

#[tokio::test]
async fn test_producer_set_transport_without_parameters_rejects() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    create_transport(&ctx, 11).await;

    // No producer.receive yet, so the new Transport refuses the binding and
    // the Producer keeps its current one.
    let req = request(
        MethodId::ProducerSetTransport,
        json!({ "producerId": 100, "transportId": 11 }),
        json!({}),
    );
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Producer has no RTP parameters");

    let producer = ctx.peer.get_producer(100).await.unwrap();
    assert_eq!(producer.transport().await.unwrap().id(), 10);
}

// T1: parameter intake reduces against the peer capabilities.
#[tokio::test]
async fn test_producer_receive_reduces_parameters() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;

    let req = request(
        MethodId::ProducerReceive,
        json!({ "producerId": 100 }),
        json!({
            "codecs": [
                {"name": "VP8", "payloadType": 101, "clockRate": 90000},
                {"name": "H264", "payloadType": 102, "clockRate": 90000}
            ],
            "encodings": [
                {"ssrc": 7777, "codecPayloadType": 101},
                {"ssrc": 8888, "codecPayloadType": 102}
            ],
            "headerExtensions": [
                {"uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "id": 1},
                {"uri": "urn:3gpp:video-orientation", "id": 4}
            ]
        }),
    );
    let reply = ctx.peer.handle_request(&req).await.unwrap().unwrap();

    assert_eq!(reply["codecs"].as_array().unwrap().len(), 1);
    assert_eq!(reply["codecs"][0]["name"], "VP8");
    assert_eq!(reply["encodings"].as_array().unwrap().len(), 1);
    assert_eq!(reply["encodings"][0]["ssrc"], 7777);
    assert_eq!(reply["headerExtensions"].as_array().unwrap().len(), 1);

    // The surviving SSRC is registered on the Transport; the dropped one is
    // not.
    let transport = ctx.peer.get_transport(10).await.unwrap();
    assert!(transport.get_producer(7777).await.is_some());
    assert!(transport.get_producer(8888).await.is_none());

    // The Room heard about the finished intake.
    assert!(ctx
        .room
        .events()
        .contains(&RoomEvent::ProducerParameters(100)));
}

// Invariant 5: "newconsumer" fires for installed Consumers before the
// setCapabilities reply resolves, and the Room's reduction lands in the
// accept payload.
#[tokio::test]
async fn test_set_capabilities_installs_consumers_before_reply() {
    let mut ctx = setup();

    let reduced: RtpCapabilities = serde_json::from_value(audio_capabilities()).unwrap();
    *ctx.room.reduce_to.lock().unwrap() = Some(reduced);

    let consumer = new_consumer(&ctx, 300, MediaKind::Audio);
    *ctx.room.install_on_capabilities.lock().unwrap() = Some((
        Arc::downgrade(&ctx.peer),
        consumer,
        video_parameters(3000),
    ));

    let req = request(
        MethodId::PeerSetCapabilities,
        json!({}),
        full_capabilities(),
    );
    let reply = ctx.peer.handle_request(&req).await.unwrap().unwrap();

    // The accept payload is the reduced set.
    assert_eq!(reply["codecs"].as_array().unwrap().len(), 1);
    assert_eq!(reply["codecs"][0]["name"], "opus");

    // The Consumer was installed and announced before the reply.
    assert!(ctx.peer.get_consumer(300).await.is_some());
    let notifications = ctx.drain_notifications();
    let newconsumer = notifications
        .iter()
        .find(|n| n.event == "newconsumer")
        .expect("missing newconsumer notification");
    assert_eq!(newconsumer.target_id, 1);
    assert_eq!(newconsumer.data["class"], "Peer");
    assert_eq!(newconsumer.data["consumerId"], 300);
    assert_eq!(newconsumer.data["associatedProducerId"], 900);
    assert_eq!(newconsumer.data["active"], true);
}

// Invariant 2/SSRC index: every claimed SSRC resolves to its Consumer.
#[tokio::test]
async fn test_consumer_by_ssrc() {
    let ctx = setup();

    let consumer = new_consumer(&ctx, 200, MediaKind::Video);
    let params: RtpParameters = serde_json::from_value(json!({
        "codecs": [{"name": "VP8", "payloadType": 101, "clockRate": 90000}],
        "encodings": [{
            "ssrc": 1111u32,
            "codecPayloadType": 101,
            "rtx": {"ssrc": 1112u32},
            "fec": {"ssrc": 1113u32, "mechanism": "ulpfec"}
        }]
    }))
    .unwrap();
    ctx.peer.add_consumer(&consumer, params, 900).await;

    for ssrc in [1111u32, 1112, 1113] {
        let found = ctx.peer.consumer_by_ssrc(ssrc).await.unwrap();
        assert_eq!(found.id(), 200);
    }
    assert!(ctx.peer.consumer_by_ssrc(9999).await.is_none());
}

// S4: Receiver Report routing.
#[tokio::test]
async fn test_receiver_report_dispatch() {
    let ctx = setup();
    create_transport(&ctx, 10).await;
    add_consumer(&ctx, 200, MediaKind::Video, 0xDEAD_BEEF).await;

    let transport = ctx.peer.get_transport(10).await.unwrap();
    let rr = ReceiverReport {
        ssrc: 0,
        reports: vec![
            ReceptionReport {
                ssrc: 0xDEAD_BEEF,
                ..Default::default()
            },
            ReceptionReport {
                ssrc: 0xCAFE,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(rr)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;

    let events = ctx.room.events();
    let reports: Vec<&RoomEvent> = events
        .iter()
        .filter(|e| matches!(e, RoomEvent::ReceiverReport { .. }))
        .collect();
    assert_eq!(
        reports,
        vec![&RoomEvent::ReceiverReport {
            consumer_id: 200,
            ssrc: 0xDEAD_BEEF
        }]
    );
}

// SR and SDES resolve Producers through the Transport's ingress map.
#[tokio::test]
async fn test_sender_report_dispatch() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    producer_receive(&ctx, 100, 7777).await;

    let transport = ctx.peer.get_transport(10).await.unwrap();

    let known = SenderReport {
        ssrc: 7777,
        ..Default::default()
    };
    let unknown = SenderReport {
        ssrc: 9999,
        ..Default::default()
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> =
        vec![Box::new(known), Box::new(unknown)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;

    let events = ctx.room.events();
    let reports: Vec<&RoomEvent> = events
        .iter()
        .filter(|e| matches!(e, RoomEvent::SenderReport { .. }))
        .collect();
    assert_eq!(
        reports,
        vec![&RoomEvent::SenderReport {
            producer_id: 100,
            ssrc: 7777
        }]
    );
}

// Property 8: payload feedback routing, inactive drop, NACK delivery, REMB
// swallow.
#[tokio::test]
async fn test_feedback_dispatch() {
    let ctx = setup();
    create_transport(&ctx, 10).await;
    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;

    let transport = ctx.peer.get_transport(10).await.unwrap();

    let pli = PictureLossIndication {
        sender_ssrc: 42,
        media_ssrc: 1111,
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(pli.clone())];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;
    assert_eq!(
        ctx.room
            .events()
            .iter()
            .filter(|e| **e == RoomEvent::Feedback(200))
            .count(),
        1
    );

    // Unknown media SSRC: logged, no up-call.
    let stray = PictureLossIndication {
        sender_ssrc: 42,
        media_ssrc: 5555,
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(stray)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;
    assert_eq!(
        ctx.room
            .events()
            .iter()
            .filter(|e| matches!(e, RoomEvent::Feedback(_)))
            .count(),
        1
    );

    // NACK reaches the Consumer's retransmission path.
    let nack = TransportLayerNack {
        sender_ssrc: 42,
        media_ssrc: 1111,
        nacks: vec![NackPair {
            packet_id: 7,
            lost_packets: 0b1,
        }],
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(nack)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;
    let consumer = ctx.peer.get_consumer(200).await.unwrap();
    assert_eq!(consumer.nacks_received(), 2);

    // REMB is swallowed by the Peer.
    let remb = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 42,
        bitrate: 1_000_000.0,
        ssrcs: vec![1111],
    };
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(remb)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;

    // Inactive Consumer: PLI dropped silently.
    let req = request(MethodId::ConsumerDisable, json!({ "consumerId": 200 }), json!({}));
    ctx.peer.handle_request(&req).await.unwrap();
    let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(pli)];
    ctx.peer.on_transport_rtcp_packet(&transport, &packets).await;
    assert_eq!(
        ctx.room
            .events()
            .iter()
            .filter(|e| matches!(e, RoomEvent::Feedback(_)))
            .count(),
        1
    );
}

// Property 7: full frame per video/depth Consumer on transport connect.
#[tokio::test]
async fn test_full_frame_on_connect() {
    let ctx = setup();
    create_transport(&ctx, 10).await;
    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;
    add_consumer(&ctx, 201, MediaKind::Audio, 2222).await;
    add_consumer(&ctx, 202, MediaKind::Depth, 3333).await;

    let transport = ctx.peer.get_transport(10).await.unwrap();
    for id in [200u32, 201, 202] {
        let req = request(
            MethodId::ConsumerSetTransport,
            json!({ "consumerId": id, "transportId": 10 }),
            json!({}),
        );
        ctx.peer.handle_request(&req).await.unwrap();
    }

    transport.set_connected().await;

    let events = ctx.room.events();
    let full_frames: Vec<&RoomEvent> = events
        .iter()
        .filter(|e| matches!(e, RoomEvent::FullFrameRequired(_)))
        .collect();
    assert_eq!(full_frames.len(), 2);
    assert!(full_frames.contains(&&RoomEvent::FullFrameRequired(200)));
    assert!(full_frames.contains(&&RoomEvent::FullFrameRequired(202)));
}

// Property 3: transport close clears every reference.
#[tokio::test]
async fn test_transport_close_clears_references() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    producer_receive(&ctx, 100, 7777).await;
    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;
    let req = request(
        MethodId::ConsumerSetTransport,
        json!({ "consumerId": 200, "transportId": 10 }),
        json!({}),
    );
    ctx.peer.handle_request(&req).await.unwrap();

    let req = request(MethodId::TransportClose, json!({ "transportId": 10 }), json!({}));
    ctx.peer.handle_request(&req).await.unwrap();

    assert!(ctx.peer.get_transport(10).await.is_none());

    let producer = ctx.peer.get_producer(100).await.unwrap();
    assert!(producer.transport().await.is_none());

    let consumer = ctx.peer.get_consumer(200).await.unwrap();
    assert!(consumer.transport().await.is_none());

    let dump = ctx.peer.dump().await;
    assert_eq!(dump["transports"].as_array().unwrap().len(), 0);
    assert!(dump["producers"][0]["transportId"].is_null());
}

// Property 1: the dump mirrors exactly the entities created minus closed.
#[tokio::test]
async fn test_dump_ownership() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_transport(&ctx, 11).await;
    create_producer(&ctx, 100, 10, "video").await;
    create_producer(&ctx, 101, 11, "audio").await;
    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;

    let req = request(MethodId::ProducerClose, json!({ "producerId": 101 }), json!({}));
    ctx.peer.handle_request(&req).await.unwrap();

    let dump = ctx.peer.dump().await;
    assert_eq!(dump["peerId"], 1);
    assert_eq!(dump["peerName"], "alice");
    assert!(dump.get("capabilities").is_some());

    let mut transport_ids: Vec<u64> = dump["transports"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["transportId"].as_u64().unwrap())
        .collect();
    transport_ids.sort_unstable();
    assert_eq!(transport_ids, vec![10, 11]);

    let producer_ids: Vec<u64> = dump["producers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["producerId"].as_u64().unwrap())
        .collect();
    assert_eq!(producer_ids, vec![100]);

    let consumer_ids: Vec<u64> = dump["consumers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["consumerId"].as_u64().unwrap())
        .collect();
    assert_eq!(consumer_ids, vec![200]);
}

// Property 6 / S5: the RTCP interval law.
#[tokio::test]
async fn test_rtcp_interval_law() {
    assert_eq!(Peer::rtcp_interval_ms(2000), 180);
    assert_eq!(Peer::rtcp_interval_ms(360), 1000);
    assert_eq!(Peer::rtcp_interval_ms(100), MAX_VIDEO_INTERVAL_MS);
    assert_eq!(Peer::rtcp_interval_ms(0), MAX_VIDEO_INTERVAL_MS);

    let ctx = setup();
    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;
    add_consumer(&ctx, 201, MediaKind::Video, 2222).await;

    // 500 kbit/s and 1500 kbit/s of egress within the rate window.
    let consumer_a = ctx.peer.get_consumer(200).await.unwrap();
    let consumer_b = ctx.peer.get_consumer(201).await.unwrap();
    let packet_a = rtp::packet::Packet {
        payload: vec![0u8; 6250].into(),
        ..Default::default()
    };
    let packet_b = rtp::packet::Packet {
        payload: vec![0u8; 18750].into(),
        ..Default::default()
    };
    for i in 1..=10u64 {
        consumer_a.send_rtp_packet(&packet_a, 100 * i).await;
        consumer_b.send_rtp_packet(&packet_b, 100 * i).await;
    }

    // Aggregate 2000 kbit/s, base interval 180 ms, jitter in [0.5, 1.5].
    for _ in 0..50 {
        let interval = ctx.peer.next_rtcp_interval(1000).await.as_millis() as u64;
        assert!(
            (90..=270).contains(&interval),
            "interval {} out of range",
            interval
        );
    }

    // No consumers at all: the maximum video interval, jittered.
    let idle = setup();
    for _ in 0..50 {
        let interval = idle.peer.next_rtcp_interval(1000).await.as_millis() as u64;
        assert!((500..=1500).contains(&interval));
    }
}

// The tick sends one compound per sender report plus one with the receiver
// reports.
#[tokio::test]
async fn test_send_rtcp_flushes_per_sender() {
    struct Recorder {
        sent: SyncMutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl crate::transport::RtcpWriter for Recorder {
        async fn write_rtcp(&self, data: &Bytes) -> Result<usize> {
            self.sent.lock().unwrap().push(data.clone());
            Ok(data.len())
        }
    }

    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    producer_receive(&ctx, 100, 7777).await;

    add_consumer(&ctx, 200, MediaKind::Video, 1111).await;
    add_consumer(&ctx, 201, MediaKind::Video, 2222).await;
    for id in [200u32, 201] {
        let req = request(
            MethodId::ConsumerSetTransport,
            json!({ "consumerId": id, "transportId": 10 }),
            json!({}),
        );
        ctx.peer.handle_request(&req).await.unwrap();
    }

    let recorder = Arc::new(Recorder {
        sent: SyncMutex::new(Vec::new()),
    });
    let transport = ctx.peer.get_transport(10).await.unwrap();
    let recorder_dyn: Arc<dyn RtcpWriter> = recorder.clone();
    transport.set_rtcp_writer(recorder_dyn).await;

    ctx.peer.send_rtcp(5000).await;

    let sent = recorder.sent.lock().unwrap().clone();
    // One compound per Sender Report plus one carrying the reception report.
    assert_eq!(sent.len(), 3);

    let mut sender_reports = 0;
    let mut receiver_reports = 0;
    for data in &sent {
        let mut buf = &data[..];
        for packet in rtcp::packet::unmarshal(&mut buf).unwrap() {
            if packet.as_any().downcast_ref::<SenderReport>().is_some() {
                sender_reports += 1;
            }
            if let Some(rr) = packet.as_any().downcast_ref::<ReceiverReport>() {
                receiver_reports += rr.reports.len();
            }
        }
    }
    assert_eq!(sender_reports, 2);
    assert_eq!(receiver_reports, 1);
}

// S6: the close cascade.
#[tokio::test]
async fn test_close_cascade() {
    let mut ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_transport(&ctx, 11).await;
    for (producer_id, transport_id) in [(100u32, 10u32), (101, 10), (102, 11)] {
        create_producer(&ctx, producer_id, transport_id, "video").await;
    }
    for consumer_id in [200u32, 201, 202, 203] {
        add_consumer(&ctx, consumer_id, MediaKind::Video, consumer_id * 10).await;
    }
    ctx.drain_notifications();

    let req = request(MethodId::PeerClose, json!({}), json!({}));
    ctx.peer.handle_request(&req).await.unwrap();

    assert!(ctx.peer.is_closed());
    let dump = ctx.peer.dump().await;
    assert_eq!(dump["transports"].as_array().unwrap().len(), 0);
    assert_eq!(dump["producers"].as_array().unwrap().len(), 0);
    assert_eq!(dump["consumers"].as_array().unwrap().len(), 0);

    // Destruction order: producers, then consumers, then transports; the
    // Room hears about the Peer exactly once, last.
    let events = ctx.room.events();
    let positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            RoomEvent::ProducerClosed(_) => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 3);
    let consumer_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            RoomEvent::ConsumerClosed(_) => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(consumer_positions.len(), 4);
    assert!(positions.iter().max() < consumer_positions.iter().min());

    let peer_closed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            RoomEvent::PeerClosed(1) => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(peer_closed.len(), 1);
    assert_eq!(peer_closed[0], events.len() - 1);

    // Every entity said goodbye on the channel: 3 producers, 4 consumers,
    // 2 transports and the peer itself.
    let notifications = ctx.drain_notifications();
    let closes = notifications.iter().filter(|n| n.event == "close").count();
    assert_eq!(closes, 10);

    // Closing again is a no-op.
    ctx.peer.close().await;
    let events_after = ctx.room.events();
    assert_eq!(events_after.len(), events.len());
}

// Re-binding after a transport close works; the streams survive.
#[tokio::test]
async fn test_rebind_after_transport_close() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;
    producer_receive(&ctx, 100, 7777).await;

    let req = request(MethodId::TransportClose, json!({ "transportId": 10 }), json!({}));
    ctx.peer.handle_request(&req).await.unwrap();

    create_transport(&ctx, 11).await;
    let req = request(
        MethodId::ProducerSetTransport,
        json!({ "producerId": 100, "transportId": 11 }),
        json!({}),
    );
    ctx.peer.handle_request(&req).await.unwrap();

    let producer = ctx.peer.get_producer(100).await.unwrap();
    assert_eq!(producer.transport().await.unwrap().id(), 11);
}

#[tokio::test]
async fn test_unknown_entity_requests_reject() {
    let ctx = setup();

    let req = request(MethodId::TransportDump, json!({ "transportId": 1 }), json!({}));
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Transport does not exist");

    let req = request(MethodId::ProducerDump, json!({ "producerId": 1 }), json!({}));
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Producer does not exist");

    let req = request(MethodId::ConsumerDump, json!({ "consumerId": 1 }), json!({}));
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "Consumer does not exist");

    let req = request(MethodId::ConsumerDump, json!({}), json!({}));
    let err = ctx.peer.handle_request(&req).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Request has not numeric internal.consumerId"
    );
}

// RTP ingress reaches the Room for fan-out.
#[tokio::test]
async fn test_rtp_packet_forwarding() {
    let ctx = setup();
    set_capabilities(&ctx).await;
    create_transport(&ctx, 10).await;
    create_producer(&ctx, 100, 10, "video").await;

    let producer = ctx.peer.get_producer(100).await.unwrap();
    let packet = rtp::packet::Packet::default();
    producer.receive_rtp_packet(&packet).await;

    assert!(ctx.room.events().contains(&RoomEvent::RtpPacket(100)));
}
