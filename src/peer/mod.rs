#[cfg(test)]
mod peer_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use rtcp::goodbye::Goodbye;
use rtcp::header::PacketType;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::payload_feedbacks::slice_loss_indication::SliceLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::channel::{ChannelNotifier, MethodId, Request};
use crate::compound_packet::{CompoundPacketBuilder, MAX_VIDEO_INTERVAL_MS, RTCP_BUFFER_SIZE};
use crate::consumer::{Consumer, ConsumerListener, SharedCapabilities};
use crate::error::{Error, Result};
use crate::producer::{Producer, ProducerListener};
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::{Transport, TransportListener};

/// Up-calls a Peer raises into the enclosing Room.
///
/// All methods carry the `peer_id` as the routing key; the Room owns the Peer
/// handle itself.
#[async_trait]
pub trait PeerListener: Send + Sync {
    /// Final notification, after every owned entity has been destroyed.
    async fn on_peer_closed(&self, peer_id: u32);

    /// Capabilities were assigned. The Room reduces them in place to a subset
    /// of the room-wide capabilities and installs a Consumer on this Peer for
    /// every existing Producer in the Room before returning; the
    /// setCapabilities request resolves only afterwards.
    ///
    /// The Peer's capabilities storage is write-locked for the duration of
    /// this call: implementations must work on the given reference and must
    /// not read the capabilities back through the Peer.
    async fn on_peer_capabilities(&self, peer_id: u32, capabilities: &mut RtpCapabilities);

    /// A Producer finished its parameter intake.
    async fn on_peer_producer_parameters(&self, peer_id: u32, producer: &Arc<Producer>);

    async fn on_peer_producer_closed(&self, peer_id: u32, producer: &Arc<Producer>);

    async fn on_peer_consumer_closed(&self, peer_id: u32, consumer: &Arc<Consumer>);

    /// Ingress RTP to fan out to Consumers on other Peers.
    async fn on_peer_rtp_packet(
        &self,
        peer_id: u32,
        producer: &Arc<Producer>,
        packet: &rtp::packet::Packet,
    );

    /// A Sender Report arrived for one of this Peer's ingress streams.
    async fn on_peer_rtcp_sender_report(
        &self,
        peer_id: u32,
        producer: &Arc<Producer>,
        report: &SenderReport,
    );

    /// A reception report arrived for one of this Peer's egress streams.
    async fn on_peer_rtcp_receiver_report(
        &self,
        peer_id: u32,
        consumer: &Arc<Consumer>,
        report: &ReceptionReport,
    );

    /// Payload-specific feedback (PLI/SLI/FIR) addressed to an active egress
    /// stream; the Room relays it toward the originating Producer.
    async fn on_peer_rtcp_feedback(
        &self,
        peer_id: u32,
        consumer: &Arc<Consumer>,
        packet: Box<dyn rtcp::packet::Packet + Send + Sync>,
    );

    /// An egress stream needs a key frame from its originating Producer.
    async fn on_full_frame_required(&self, peer_id: u32, consumer: &Arc<Consumer>);
}

/// Server-side representation of one participant.
///
/// Owns the participant's Transports, Producers and Consumers, dispatches the
/// control-plane requests addressed to them, demultiplexes incoming RTCP by
/// SSRC, and periodically emits one RTCP compound per Transport on a
/// bandwidth-adapted, jittered interval.
///
/// Must be created inside a tokio runtime; construction starts the RTCP
/// timer task, and [`Peer::close`] (or dropping the last handle) stops it.
pub struct Peer {
    peer_id: u32,
    peer_name: String,
    listener: Weak<dyn PeerListener>,
    notifier: Arc<ChannelNotifier>,
    capabilities: SharedCapabilities,
    has_capabilities: AtomicBool,
    transports: Mutex<HashMap<u32, Arc<Transport>>>,
    producers: Mutex<HashMap<u32, Arc<Producer>>>,
    consumers: Mutex<HashMap<u32, Arc<Consumer>>>,
    rtcp_close_tx: Mutex<Option<mpsc::Sender<()>>>,
    closed: AtomicBool,
    origin: Instant,
    weak_self: Weak<Peer>,
}

impl Peer {
    pub fn new(
        listener: Weak<dyn PeerListener>,
        notifier: Arc<ChannelNotifier>,
        peer_id: u32,
        peer_name: String,
    ) -> Arc<Self> {
        let (close_tx, close_rx) = mpsc::channel(1);

        let peer = Arc::new_cyclic(|weak_self| Peer {
            peer_id,
            peer_name,
            listener,
            notifier,
            capabilities: Arc::new(RwLock::new(None)),
            has_capabilities: AtomicBool::new(false),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            rtcp_close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
            origin: Instant::now(),
            weak_self: weak_self.clone(),
        });

        // Start the RTCP timer.
        tokio::spawn(Peer::rtcp_task(Arc::downgrade(&peer), close_rx));

        peer
    }

    pub fn id(&self) -> u32 {
        self.peer_id
    }

    pub fn name(&self) -> &str {
        &self.peer_name
    }

    pub fn has_capabilities(&self) -> bool {
        self.has_capabilities.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Milliseconds since this Peer was created; the clock every RTCP
    /// computation runs on.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Dispatches a control-plane request addressed to this Peer or one of
    /// its owned entities. `Ok` accepts with an optional payload, `Err`
    /// rejects with the reason; every request is answered exactly once and
    /// collaborator failures never escape as panics.
    pub async fn handle_request(&self, request: &Request) -> Result<Option<Value>> {
        match request.method {
            MethodId::PeerClose => {
                self.close().await;

                log::debug!("Peer closed [peerId:{}]", self.peer_id);

                Ok(None)
            }

            MethodId::PeerDump => Ok(Some(self.dump().await)),

            MethodId::PeerSetCapabilities => {
                // Capabilities must not be set.
                if self.has_capabilities() {
                    return Err(Error::ErrCapabilitiesAlreadySet);
                }

                let parsed: RtpCapabilities = serde_json::from_value(request.data.clone())?;

                let mut guard = self.capabilities.write().await;
                let capabilities = guard.insert(parsed);
                self.has_capabilities.store(true, Ordering::SeqCst);

                // The Room reduces the capabilities in place and installs a
                // Consumer for every existing Producer. Accepting only after
                // this call guarantees the "newconsumer" events for all of
                // them precede the setCapabilities reply.
                if let Some(listener) = self.listener.upgrade() {
                    listener
                        .on_peer_capabilities(self.peer_id, capabilities)
                        .await;
                }

                let data = serde_json::to_value(&*capabilities)?;

                Ok(Some(data))
            }

            MethodId::PeerCreateTransport => {
                let (transport_id, transport) = self.transport_from_request(request).await?;

                if transport.is_some() {
                    return Err(Error::ErrTransportAlreadyExists);
                }

                let listener: Weak<dyn TransportListener> = self.weak_self.clone();
                let transport = Transport::new(
                    listener,
                    Arc::clone(&self.notifier),
                    transport_id,
                    &request.data,
                )?;

                {
                    let mut transports = self.transports.lock().await;
                    transports.insert(transport_id, Arc::clone(&transport));
                }

                log::debug!("Transport created [transportId:{}]", transport_id);

                Ok(Some(transport.dump().await))
            }

            MethodId::PeerCreateProducer => {
                // Capabilities must be set.
                if !self.has_capabilities() {
                    return Err(Error::ErrCapabilitiesNotSet);
                }

                let (producer_id, producer) = self.producer_from_request(request).await?;

                if producer.is_some() {
                    return Err(Error::ErrProducerAlreadyExists);
                }

                let (_, transport) = self.transport_from_request(request).await?;
                let transport = transport.ok_or(Error::ErrTransportNotFound)?;

                // `kind` is mandatory.
                let kind = request
                    .data
                    .get("kind")
                    .and_then(Value::as_str)
                    .ok_or(Error::ErrMissingKind)?
                    .parse::<MediaKind>()?;

                let listener: Weak<dyn ProducerListener> = self.weak_self.clone();
                let producer =
                    Producer::new(listener, Arc::clone(&self.notifier), producer_id, kind);

                {
                    let mut producers = self.producers.lock().await;
                    producers.insert(producer_id, Arc::clone(&producer));
                }

                log::debug!("Producer created [producerId:{}]", producer_id);

                producer.set_transport(&transport).await;

                Ok(None)
            }

            MethodId::TransportClose
            | MethodId::TransportDump
            | MethodId::TransportSetRemoteDtlsParameters
            | MethodId::TransportSetMaxBitrate
            | MethodId::TransportChangeUfragPwd => {
                let (_, transport) = self.transport_from_request(request).await?;
                let transport = transport.ok_or(Error::ErrTransportNotFound)?;

                // A close request removes the Transport from the registry
                // through its own up-call; it must not be touched afterwards.
                transport.handle_request(request).await
            }

            MethodId::ProducerClose
            | MethodId::ProducerDump
            | MethodId::ProducerReceive
            | MethodId::ProducerSetRtpRawEvent
            | MethodId::ProducerSetRtpObjectEvent => {
                let (_, producer) = self.producer_from_request(request).await?;
                let producer = producer.ok_or(Error::ErrProducerNotFound)?;

                producer.handle_request(request).await
            }

            MethodId::ProducerSetTransport => {
                let (_, producer) = self.producer_from_request(request).await?;
                let producer = producer.ok_or(Error::ErrProducerNotFound)?;

                let (_, transport) = self.transport_from_request(request).await?;
                let transport = transport.ok_or(Error::ErrTransportNotFound)?;

                // Register on the new Transport first so a failure leaves the
                // Producer's current binding untouched.
                transport.add_producer(&producer).await?;

                // Keep REMB active across the switch if the previous
                // Transport had it on.
                if let Some(previous) = producer.transport().await {
                    if previous.has_remb() {
                        transport.enable_remb();
                    }
                }

                producer.set_transport(&transport).await;

                Ok(None)
            }

            MethodId::ConsumerDump | MethodId::ConsumerDisable => {
                let (_, consumer) = self.consumer_from_request(request).await?;
                let consumer = consumer.ok_or(Error::ErrConsumerNotFound)?;

                consumer.handle_request(request).await
            }

            MethodId::ConsumerSetTransport => {
                let (_, consumer) = self.consumer_from_request(request).await?;
                let consumer = consumer.ok_or(Error::ErrConsumerNotFound)?;

                let (_, transport) = self.transport_from_request(request).await?;
                let transport = transport.ok_or(Error::ErrTransportNotFound)?;

                consumer.set_transport(&transport).await;

                Ok(None)
            }
        }
    }

    /// Installs a Consumer created by the Room for a Producer on another
    /// Peer. When this returns, the Consumer is registered and the
    /// "newconsumer" notification has been emitted.
    ///
    /// Installing a Consumer whose id is already present is a programmer
    /// error and panics.
    pub async fn add_consumer(
        &self,
        consumer: &Arc<Consumer>,
        rtp_parameters: RtpParameters,
        associated_producer_id: u32,
    ) {
        {
            let consumers = self.consumers.lock().await;
            assert!(
                !consumers.contains_key(&consumer.id()),
                "given Consumer already exists in this Peer"
            );
        }

        // Share this Peer's capabilities storage with the Consumer.
        consumer
            .set_peer_capabilities(Arc::clone(&self.capabilities))
            .await;

        // Provide the Consumer with the received RTP parameters.
        consumer.send(rtp_parameters).await;

        {
            let mut consumers = self.consumers.lock().await;
            consumers.insert(consumer.id(), Arc::clone(consumer));
        }

        let mut event_data = consumer.dump().await;
        if let Some(object) = event_data.as_object_mut() {
            object.insert("class".to_owned(), json!("Peer"));
            object.insert(
                "associatedProducerId".to_owned(),
                json!(associated_producer_id),
            );
        }

        self.notifier.emit(self.peer_id, "newconsumer", event_data);
    }

    pub async fn get_transport(&self, transport_id: u32) -> Option<Arc<Transport>> {
        let transports = self.transports.lock().await;
        transports.get(&transport_id).cloned()
    }

    pub async fn get_producer(&self, producer_id: u32) -> Option<Arc<Producer>> {
        let producers = self.producers.lock().await;
        producers.get(&producer_id).cloned()
    }

    pub async fn get_consumer(&self, consumer_id: u32) -> Option<Arc<Consumer>> {
        let consumers = self.consumers.lock().await;
        consumers.get(&consumer_id).cloned()
    }

    /// Every Producer of this Peer; the Room iterates these when a new
    /// participant joins.
    pub async fn producers(&self) -> Vec<Arc<Producer>> {
        let producers = self.producers.lock().await;
        producers.values().cloned().collect()
    }

    pub async fn consumers(&self) -> Vec<Arc<Consumer>> {
        let consumers = self.consumers.lock().await;
        consumers.values().cloned().collect()
    }

    /// The SSRC index: resolves the Consumer whose RTP parameters claim the
    /// given SSRC (primary, RTX or FEC). First match wins; the per-peer SSRC
    /// disjointness invariant makes the order irrelevant.
    pub async fn consumer_by_ssrc(&self, ssrc: u32) -> Option<Arc<Consumer>> {
        let consumers = self.consumers.lock().await;
        for consumer in consumers.values() {
            if consumer.claims_ssrc(ssrc).await {
                return Some(Arc::clone(consumer));
            }
        }
        None
    }

    /// One RTCP timer tick: for every Transport, collect the bound
    /// Consumers' Sender Reports (flushing one compound per sender) and the
    /// bound Producers' reception reports, and send the result.
    pub async fn send_rtcp(&self, now_ms: u64) {
        let transports: Vec<Arc<Transport>> = {
            let transports = self.transports.lock().await;
            transports.values().cloned().collect()
        };
        let consumers: Vec<Arc<Consumer>> = {
            let consumers = self.consumers.lock().await;
            consumers.values().cloned().collect()
        };
        let producers: Vec<Arc<Producer>> = {
            let producers = self.producers.lock().await;
            producers.values().cloned().collect()
        };

        for transport in &transports {
            let mut packet = CompoundPacketBuilder::new();

            for consumer in &consumers {
                if !is_bound(consumer.transport().await, transport) {
                    continue;
                }

                consumer.get_rtcp(&mut packet, now_ms).await;

                // Send one RTCP compound packet per sender report.
                if packet.sender_report_count() != 0 {
                    if packet.marshal_size() > RTCP_BUFFER_SIZE {
                        log::warn!(
                            "cannot send RTCP packet, size too big ({} bytes)",
                            packet.marshal_size()
                        );
                        return;
                    }
                    match packet.marshal() {
                        Ok(data) => transport.send_rtcp_compound_packet(&data).await,
                        Err(err) => log::error!("failed to serialize RTCP compound: {}", err),
                    }
                    packet = CompoundPacketBuilder::new();
                }
            }

            for producer in &producers {
                if !is_bound(producer.transport().await, transport) {
                    continue;
                }

                producer.get_rtcp(&mut packet, now_ms).await;
            }

            // Send one RTCP compound with all receiver reports.
            if packet.receiver_report_count() != 0 {
                if packet.marshal_size() > RTCP_BUFFER_SIZE {
                    log::warn!(
                        "cannot send RTCP packet, size too big ({} bytes)",
                        packet.marshal_size()
                    );
                    return;
                }
                match packet.marshal() {
                    Ok(data) => transport.send_rtcp_compound_packet(&data).await,
                    Err(err) => log::error!("failed to serialize RTCP compound: {}", err),
                }
            }
        }
    }

    /// The RFC 3550 interval rule scaled for this SFU: 360 over the
    /// aggregate egress bandwidth in kbit/s, clamped to the video maximum.
    pub(crate) fn rtcp_interval_ms(rate_kbps: u64) -> u64 {
        if rate_kbps == 0 {
            return MAX_VIDEO_INTERVAL_MS;
        }
        (360_000 / rate_kbps).min(MAX_VIDEO_INTERVAL_MS)
    }

    /// Computes the next RTCP interval from the aggregate Consumer
    /// transmission rate and varies it randomly over [0.5, 1.5] so peers do
    /// not synchronize their RTCP.
    pub async fn next_rtcp_interval(&self, now_ms: u64) -> Duration {
        let consumers: Vec<Arc<Consumer>> = {
            let consumers = self.consumers.lock().await;
            consumers.values().cloned().collect()
        };

        let mut interval = MAX_VIDEO_INTERVAL_MS;
        if !consumers.is_empty() {
            let mut rate_kbps = 0u64;
            for consumer in &consumers {
                rate_kbps += consumer.get_transmission_rate(now_ms).await / 1000;
            }
            if rate_kbps != 0 {
                interval = Peer::rtcp_interval_ms(rate_kbps);
            }
        }

        let factor = rand::thread_rng().gen_range(5..=15u64);
        Duration::from_millis(interval * factor / 10)
    }

    /// Destroys this Peer: children in the order Producers, Consumers,
    /// Transports, then the "close" notification and the final Room up-call.
    /// Idempotent; the RTCP timer never fires again once this starts.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop the RTCP timer.
        {
            let mut close_tx = self.rtcp_close_tx.lock().await;
            close_tx.take();
        }

        // Close all the Producers.
        let producers: Vec<Arc<Producer>> = {
            let mut producers = self.producers.lock().await;
            producers.drain().map(|(_, producer)| producer).collect()
        };
        for producer in producers {
            producer.close().await;
        }

        // Close all the Consumers.
        let consumers: Vec<Arc<Consumer>> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in consumers {
            consumer.close().await;
        }

        // Close all the Transports. Stream closure raises events into the
        // owning Transport, so Transports must go last.
        let transports: Vec<Arc<Transport>> = {
            let mut transports = self.transports.lock().await;
            transports.drain().map(|(_, transport)| transport).collect()
        };
        for transport in transports {
            transport.close().await;
        }

        self.notifier
            .emit(self.peer_id, "close", json!({"class": "Peer"}));

        if let Some(listener) = self.listener.upgrade() {
            listener.on_peer_closed(self.peer_id).await;
        }
    }

    pub async fn dump(&self) -> Value {
        let capabilities = { self.capabilities.read().await.clone() };

        let transports: Vec<Arc<Transport>> = {
            let transports = self.transports.lock().await;
            transports.values().cloned().collect()
        };
        let mut transport_dumps = Vec::with_capacity(transports.len());
        for transport in &transports {
            transport_dumps.push(transport.dump().await);
        }

        let producers: Vec<Arc<Producer>> = {
            let producers = self.producers.lock().await;
            producers.values().cloned().collect()
        };
        let mut producer_dumps = Vec::with_capacity(producers.len());
        for producer in &producers {
            producer_dumps.push(producer.dump().await);
        }

        let consumers: Vec<Arc<Consumer>> = {
            let consumers = self.consumers.lock().await;
            consumers.values().cloned().collect()
        };
        let mut consumer_dumps = Vec::with_capacity(consumers.len());
        for consumer in &consumers {
            consumer_dumps.push(consumer.dump().await);
        }

        let mut dump = json!({
            "peerId": self.peer_id,
            "peerName": self.peer_name,
            "transports": transport_dumps,
            "producers": producer_dumps,
            "consumers": consumer_dumps,
        });
        if let Some(capabilities) = capabilities {
            if let Ok(value) = serde_json::to_value(&capabilities) {
                dump["capabilities"] = value;
            }
        }

        dump
    }

    async fn transport_from_request(
        &self,
        request: &Request,
    ) -> Result<(u32, Option<Arc<Transport>>)> {
        let transport_id = request
            .internal_u32("transportId")
            .ok_or(Error::ErrInvalidTransportId)?;
        let transport = {
            let transports = self.transports.lock().await;
            transports.get(&transport_id).cloned()
        };
        Ok((transport_id, transport))
    }

    async fn producer_from_request(
        &self,
        request: &Request,
    ) -> Result<(u32, Option<Arc<Producer>>)> {
        let producer_id = request
            .internal_u32("producerId")
            .ok_or(Error::ErrInvalidProducerId)?;
        let producer = {
            let producers = self.producers.lock().await;
            producers.get(&producer_id).cloned()
        };
        Ok((producer_id, producer))
    }

    async fn consumer_from_request(
        &self,
        request: &Request,
    ) -> Result<(u32, Option<Arc<Consumer>>)> {
        let consumer_id = request
            .internal_u32("consumerId")
            .ok_or(Error::ErrInvalidConsumerId)?;
        let consumer = {
            let consumers = self.consumers.lock().await;
            consumers.get(&consumer_id).cloned()
        };
        Ok((consumer_id, consumer))
    }

    async fn dispatch_payload_feedback(
        &self,
        message_type: &str,
        sender_ssrc: u32,
        media_ssrc: u32,
        packet: Box<dyn rtcp::packet::Packet + Send + Sync>,
    ) {
        let consumer = match self.consumer_by_ssrc(media_ssrc).await {
            Some(consumer) => consumer,
            None => {
                log::warn!(
                    "no Consumer found for received {} Feedback packet [senderSsrc:{}, mediaSsrc:{}]",
                    message_type,
                    sender_ssrc,
                    media_ssrc
                );
                return;
            }
        };

        // If the Consumer is not active, drop the packet.
        if !consumer.is_active().await {
            return;
        }

        if message_type == "PLI" {
            log::debug!("PLI received [mediaSsrc:{}]", media_ssrc);
        }

        if let Some(listener) = self.listener.upgrade() {
            listener
                .on_peer_rtcp_feedback(self.peer_id, &consumer, packet)
                .await;
        }
    }

    async fn rtcp_task(peer: Weak<Peer>, mut close_rx: mpsc::Receiver<()>) {
        // First tick at half the maximum video interval.
        let mut interval = Duration::from_millis(MAX_VIDEO_INTERVAL_MS / 2);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let peer = match peer.upgrade() {
                        Some(peer) => peer,
                        None => return,
                    };
                    let now_ms = peer.now_ms();

                    peer.send_rtcp(now_ms).await;

                    interval = peer.next_rtcp_interval(now_ms).await;
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl TransportListener for Peer {
    async fn on_transport_connected(&self, transport: &Arc<Transport>) {
        // Every video/depth Consumer riding this Transport needs a key frame
        // to start decoding.
        let consumers: Vec<Arc<Consumer>> = {
            let consumers = self.consumers.lock().await;
            consumers.values().cloned().collect()
        };

        for consumer in &consumers {
            if !consumer.kind().has_full_frames() {
                continue;
            }
            if !is_bound(consumer.transport().await, transport) {
                continue;
            }

            if let Some(listener) = self.listener.upgrade() {
                listener.on_full_frame_required(self.peer_id, consumer).await;
            }
        }
    }

    async fn on_transport_closed(&self, transport: &Arc<Transport>) {
        // Clear every reference to the closed Transport; the streams survive
        // and may be re-bound later.
        let producers: Vec<Arc<Producer>> = {
            let producers = self.producers.lock().await;
            producers.values().cloned().collect()
        };
        for producer in &producers {
            producer.remove_transport(transport).await;
        }

        let consumers: Vec<Arc<Consumer>> = {
            let consumers = self.consumers.lock().await;
            consumers.values().cloned().collect()
        };
        for consumer in &consumers {
            consumer.remove_transport(transport).await;
        }

        let mut transports = self.transports.lock().await;
        transports.remove(&transport.id());
    }

    async fn on_transport_full_frame_required(&self, transport: &Arc<Transport>) {
        let producers: Vec<Arc<Producer>> = {
            let producers = self.producers.lock().await;
            producers.values().cloned().collect()
        };

        for producer in &producers {
            if !producer.kind().has_full_frames() {
                continue;
            }
            if !is_bound(producer.transport().await, transport) {
                continue;
            }

            producer.request_full_frame().await;
        }
    }

    async fn on_transport_rtcp_packet(
        &self,
        transport: &Arc<Transport>,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) {
        for packet in packets {
            match classify(packet.as_ref()) {
                // Feedback for egress streams, forwarded toward the remote
                // Producer behind them.
                RtcpSubPacket::ReceiverReport(rr) => {
                    for report in &rr.reports {
                        match self.consumer_by_ssrc(report.ssrc).await {
                            Some(consumer) => {
                                if let Some(listener) = self.listener.upgrade() {
                                    listener
                                        .on_peer_rtcp_receiver_report(
                                            self.peer_id,
                                            &consumer,
                                            report,
                                        )
                                        .await;
                                }
                            }
                            None => log::warn!(
                                "no Consumer found for received Receiver Report [ssrc:{}]",
                                report.ssrc
                            ),
                        }
                    }
                }

                RtcpSubPacket::Pli(pli) => {
                    self.dispatch_payload_feedback(
                        "PLI",
                        pli.sender_ssrc,
                        pli.media_ssrc,
                        Box::new(pli.clone()),
                    )
                    .await;
                }

                RtcpSubPacket::Sli(sli) => {
                    self.dispatch_payload_feedback(
                        "SLI",
                        sli.sender_ssrc,
                        sli.media_ssrc,
                        Box::new(sli.clone()),
                    )
                    .await;
                }

                RtcpSubPacket::Fir(fir) => {
                    self.dispatch_payload_feedback(
                        "FIR",
                        fir.sender_ssrc,
                        fir.media_ssrc,
                        Box::new(fir.clone()),
                    )
                    .await;
                }

                // REMB belongs to the Transport's congestion control; the
                // Peer swallows it.
                RtcpSubPacket::Remb(remb) => {
                    log::debug!(
                        "ignoring REMB feedback, handled at the transport level [senderSsrc:{}]",
                        remb.sender_ssrc
                    );
                }

                RtcpSubPacket::Nack(nack) => {
                    match self.consumer_by_ssrc(nack.media_ssrc).await {
                        Some(consumer) => consumer.receive_nack(nack).await,
                        None => log::warn!(
                            "no Consumer found for received NACK Feedback packet [senderSsrc:{}, mediaSsrc:{}]",
                            nack.sender_ssrc,
                            nack.media_ssrc
                        ),
                    }
                }

                // RTCP from the remote sender about its own ingress streams,
                // looked up on the Transport they arrive on.
                RtcpSubPacket::SenderReport(sr) => {
                    match transport.get_producer(sr.ssrc).await {
                        Some(producer) => {
                            if let Some(listener) = self.listener.upgrade() {
                                listener
                                    .on_peer_rtcp_sender_report(self.peer_id, &producer, sr)
                                    .await;
                            }
                        }
                        None => log::warn!(
                            "no Producer found for received Sender Report [ssrc:{}]",
                            sr.ssrc
                        ),
                    }
                }

                RtcpSubPacket::SourceDescription(sdes) => {
                    for chunk in &sdes.chunks {
                        if transport.get_producer(chunk.source).await.is_none() {
                            log::warn!(
                                "no Producer found for received SDES chunk [ssrc:{}]",
                                chunk.source
                            );
                        }
                    }
                }

                RtcpSubPacket::Bye(_) => {
                    log::debug!("ignoring received RTCP BYE");
                }

                RtcpSubPacket::Unhandled(packet) => {
                    let header = packet.header();
                    match header.packet_type {
                        PacketType::PayloadSpecificFeedback => log::warn!(
                            "ignoring unsupported Payload Specific Feedback packet [fmt:{}]",
                            header.count
                        ),
                        PacketType::TransportSpecificFeedback => log::warn!(
                            "ignoring unsupported RTP Feedback packet [fmt:{}]",
                            header.count
                        ),
                        packet_type => log::warn!(
                            "unhandled RTCP type received [type:{:?}]",
                            packet_type
                        ),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProducerListener for Peer {
    async fn on_producer_parameters(&self, producer: &Arc<Producer>) -> Result<()> {
        // Remove unsupported codecs, their encodings and unsupported header
        // extensions before the stream goes live.
        let capabilities = { self.capabilities.read().await.clone() };
        if let Some(capabilities) = &capabilities {
            producer.reduce_rtp_parameters(capabilities).await;
        }

        if let Some(transport) = producer.transport().await {
            transport.add_producer(producer).await?;
        }

        Ok(())
    }

    async fn on_producer_parameters_done(&self, producer: &Arc<Producer>) {
        if let Some(listener) = self.listener.upgrade() {
            listener
                .on_peer_producer_parameters(self.peer_id, producer)
                .await;
        }
    }

    async fn on_producer_rtp_packet(&self, producer: &Arc<Producer>, packet: &rtp::packet::Packet) {
        if let Some(listener) = self.listener.upgrade() {
            listener
                .on_peer_rtp_packet(self.peer_id, producer, packet)
                .await;
        }
    }

    async fn on_producer_closed(&self, producer: &Arc<Producer>) {
        // Remove the closed Producer from every Transport holding it.
        let transports: Vec<Arc<Transport>> = {
            let transports = self.transports.lock().await;
            transports.values().cloned().collect()
        };
        for transport in &transports {
            transport.remove_producer(producer).await;
        }

        {
            let mut producers = self.producers.lock().await;
            producers.remove(&producer.id());
        }

        if let Some(listener) = self.listener.upgrade() {
            listener
                .on_peer_producer_closed(self.peer_id, producer)
                .await;
        }
    }
}

#[async_trait]
impl ConsumerListener for Peer {
    async fn on_consumer_closed(&self, consumer: &Arc<Consumer>) {
        {
            let mut consumers = self.consumers.lock().await;
            consumers.remove(&consumer.id());
        }

        if let Some(listener) = self.listener.upgrade() {
            listener
                .on_peer_consumer_closed(self.peer_id, consumer)
                .await;
        }
    }

    async fn on_consumer_full_frame_required(&self, consumer: &Arc<Consumer>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_full_frame_required(self.peer_id, consumer).await;
        }
    }
}

fn is_bound(current: Option<Arc<Transport>>, transport: &Arc<Transport>) -> bool {
    current.map(|t| t.id() == transport.id()).unwrap_or(false)
}

/// One RTCP sub-packet, reshaped from the codec's trait objects into a
/// variant the demultiplexer can match on.
enum RtcpSubPacket<'a> {
    SenderReport(&'a SenderReport),
    ReceiverReport(&'a ReceiverReport),
    SourceDescription(&'a SourceDescription),
    Pli(&'a PictureLossIndication),
    Sli(&'a SliceLossIndication),
    Fir(&'a FullIntraRequest),
    Remb(&'a ReceiverEstimatedMaximumBitrate),
    Nack(&'a TransportLayerNack),
    Bye(&'a Goodbye),
    Unhandled(&'a (dyn rtcp::packet::Packet + Send + Sync)),
}

fn classify(packet: &(dyn rtcp::packet::Packet + Send + Sync)) -> RtcpSubPacket<'_> {
    let any = packet.as_any();

    if let Some(sr) = any.downcast_ref::<SenderReport>() {
        RtcpSubPacket::SenderReport(sr)
    } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
        RtcpSubPacket::ReceiverReport(rr)
    } else if let Some(sdes) = any.downcast_ref::<SourceDescription>() {
        RtcpSubPacket::SourceDescription(sdes)
    } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
        RtcpSubPacket::Pli(pli)
    } else if let Some(sli) = any.downcast_ref::<SliceLossIndication>() {
        RtcpSubPacket::Sli(sli)
    } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
        RtcpSubPacket::Fir(fir)
    } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
        RtcpSubPacket::Remb(remb)
    } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
        RtcpSubPacket::Nack(nack)
    } else if let Some(bye) = any.downcast_ref::<Goodbye>() {
        RtcpSubPacket::Bye(bye)
    } else {
        RtcpSubPacket::Unhandled(packet)
    }
}
