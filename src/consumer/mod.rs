
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescriptionChunk, SourceDescriptionItem};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::channel::{ChannelNotifier, MethodId, Request};
use crate::compound_packet::{
    CompoundPacketBuilder, MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS,
};
use crate::error::{Error, Result};
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::Transport;

/// Seconds between 1900 (NTP epoch) and 1970 (Unix epoch).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

const DEFAULT_CLOCK_RATE: u32 = 90000;
const DEFAULT_CNAME: &str = "sfu";

/// Capabilities handle shared between a Peer and its Consumers. The Room
/// reduces the inner value in place while installing Consumers, so everyone
/// observes the same storage for the Peer's lifetime.
pub type SharedCapabilities = Arc<RwLock<Option<RtpCapabilities>>>;

/// Up-calls a Consumer raises into its owning Peer.
#[async_trait]
pub trait ConsumerListener: Send + Sync {
    /// The Consumer closed.
    async fn on_consumer_closed(&self, consumer: &Arc<Consumer>);
    /// The egress stream needs a key frame from the originating Producer.
    async fn on_consumer_full_frame_required(&self, consumer: &Arc<Consumer>);
}

/// Transmission rate over a sliding one-second window.
#[derive(Debug, Default)]
struct RateCalculator {
    samples: VecDeque<(u64, usize)>,
    window_bytes: usize,
}

impl RateCalculator {
    const WINDOW_MS: u64 = 1000;

    fn update(&mut self, bytes: usize, now_ms: u64) {
        self.samples.push_back((now_ms, bytes));
        self.window_bytes += bytes;
        self.trim(now_ms);
    }

    /// Rate in bits per second at `now_ms`.
    fn rate(&mut self, now_ms: u64) -> u64 {
        self.trim(now_ms);
        (self.window_bytes as u64) * 8 * 1000 / Self::WINDOW_MS
    }

    fn trim(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(Self::WINDOW_MS);
        while let Some(&(ts, bytes)) = self.samples.front() {
            if ts > horizon {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }
}

/// An egress RTP stream: media produced by another peer and forwarded to this
/// one. Created by the Room against a remote Producer and installed via
/// `Peer::add_consumer`.
pub struct Consumer {
    consumer_id: u32,
    kind: MediaKind,
    listener: Weak<dyn ConsumerListener>,
    notifier: Arc<ChannelNotifier>,
    disabled: AtomicBool,
    peer_capabilities: Mutex<Option<SharedCapabilities>>,
    rtp_parameters: Mutex<Option<RtpParameters>>,
    transport: Mutex<Option<Weak<Transport>>>,
    transmission: Mutex<RateCalculator>,
    sent_packets: AtomicU64,
    sent_octets: AtomicU64,
    nacks_received: AtomicU64,
    last_rtcp_sent: AtomicU64,
    closed: AtomicBool,
    weak_self: Weak<Consumer>,
}

impl Consumer {
    pub fn new(
        listener: Weak<dyn ConsumerListener>,
        notifier: Arc<ChannelNotifier>,
        consumer_id: u32,
        kind: MediaKind,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Consumer {
            consumer_id,
            kind,
            listener,
            notifier,
            disabled: AtomicBool::new(false),
            peer_capabilities: Mutex::new(None),
            rtp_parameters: Mutex::new(None),
            transport: Mutex::new(None),
            transmission: Mutex::new(RateCalculator::default()),
            sent_packets: AtomicU64::new(0),
            sent_octets: AtomicU64::new(0),
            nacks_received: AtomicU64::new(0),
            last_rtcp_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.consumer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Active means enabled and carrying RTP parameters; inactive Consumers
    /// neither emit RTCP nor accept payload feedback.
    pub async fn is_active(&self) -> bool {
        if self.disabled.load(Ordering::SeqCst) || self.is_closed() {
            return false;
        }
        let rtp_parameters = self.rtp_parameters.lock().await;
        rtp_parameters.is_some()
    }

    pub async fn set_peer_capabilities(&self, capabilities: SharedCapabilities) {
        let mut peer_capabilities = self.peer_capabilities.lock().await;
        *peer_capabilities = Some(capabilities);
    }

    pub async fn has_peer_capabilities(&self) -> bool {
        self.peer_capabilities.lock().await.is_some()
    }

    pub async fn rtp_parameters(&self) -> Option<RtpParameters> {
        self.rtp_parameters.lock().await.clone()
    }

    /// Whether this Consumer's RTP parameters claim the given SSRC (primary,
    /// RTX or FEC).
    pub async fn claims_ssrc(&self, ssrc: u32) -> bool {
        let rtp_parameters = self.rtp_parameters.lock().await;
        rtp_parameters
            .as_ref()
            .map(|params| params.contains_ssrc(ssrc))
            .unwrap_or(false)
    }

    /// Assigns the RTP parameters this Consumer forwards with (derived by the
    /// Room from the associated Producer's reduced parameters).
    pub async fn send(&self, parameters: RtpParameters) {
        let mut rtp_parameters = self.rtp_parameters.lock().await;
        *rtp_parameters = Some(parameters);
    }

    pub async fn transport(&self) -> Option<Arc<Transport>> {
        let transport = self.transport.lock().await;
        transport.as_ref().and_then(Weak::upgrade)
    }

    /// Binds this Consumer to a Transport (the egress SRTP context follows
    /// the binding).
    pub async fn set_transport(&self, transport: &Arc<Transport>) {
        let mut current = self.transport.lock().await;
        *current = Some(Arc::downgrade(transport));
    }

    /// Clears the Transport reference if it points at the given Transport.
    pub async fn remove_transport(&self, transport: &Transport) {
        let mut current = self.transport.lock().await;
        let matches = current
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|t| t.id() == transport.id())
            .unwrap_or(false);
        if matches {
            *current = None;
        }
    }

    /// Egress RTP accounting; the actual forwarding is done by the Room.
    pub async fn send_rtp_packet(&self, packet: &rtp::packet::Packet, now_ms: u64) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_octets
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

        let mut transmission = self.transmission.lock().await;
        transmission.update(packet.payload.len(), now_ms);
    }

    /// Transmission rate in bits per second at `now_ms`; feeds the Peer's
    /// RTCP interval computation.
    pub async fn get_transmission_rate(&self, now_ms: u64) -> u64 {
        let mut transmission = self.transmission.lock().await;
        transmission.rate(now_ms)
    }

    /// Selective-retransmission feedback from the receiving endpoint. The
    /// retransmission buffer lives outside this core; here the request is
    /// accounted and logged.
    pub async fn receive_nack(&self, nack: &TransportLayerNack) {
        let mut lost = 0u64;
        for pair in &nack.nacks {
            lost += pair.packet_list().len() as u64;
        }
        self.nacks_received.fetch_add(lost, Ordering::Relaxed);

        log::debug!(
            "NACK received [consumerId:{}, mediaSsrc:{}, packets:{}]",
            self.consumer_id,
            nack.media_ssrc,
            lost
        );
    }

    pub fn nacks_received(&self) -> u64 {
        self.nacks_received.load(Ordering::Relaxed)
    }

    /// Appends this stream's Sender Report and SDES chunk to the compound
    /// under construction. Emission is damped to the per-kind RTCP interval.
    pub async fn get_rtcp(&self, packet: &mut CompoundPacketBuilder, now_ms: u64) {
        if !self.is_active().await {
            return;
        }

        let max_interval = match self.kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video | MediaKind::Depth => MAX_VIDEO_INTERVAL_MS,
        };
        let last_sent = self.last_rtcp_sent.load(Ordering::Relaxed);
        if (now_ms.saturating_sub(last_sent)) * 115 / 100 < max_interval {
            return;
        }

        let rtp_parameters = self.rtp_parameters.lock().await;
        let params = match rtp_parameters.as_ref() {
            Some(params) => params,
            None => return,
        };
        let ssrc = match params
            .rtcp
            .as_ref()
            .and_then(|rtcp| rtcp.ssrc)
            .or_else(|| params.encodings.first().and_then(|e| e.ssrc))
        {
            Some(ssrc) => ssrc,
            None => return,
        };
        let clock_rate = params.clock_rate().unwrap_or(DEFAULT_CLOCK_RATE);
        let cname = params
            .rtcp
            .as_ref()
            .and_then(|rtcp| rtcp.cname.clone())
            .unwrap_or_else(|| DEFAULT_CNAME.to_owned());

        packet.add_sender_report(SenderReport {
            ssrc,
            ntp_time: ntp_time(now_ms),
            rtp_time: (now_ms.wrapping_mul(u64::from(clock_rate)) / 1000) as u32,
            packet_count: self.sent_packets.load(Ordering::Relaxed) as u32,
            octet_count: self.sent_octets.load(Ordering::Relaxed) as u32,
            ..Default::default()
        });
        packet.add_sdes_chunk(SourceDescriptionChunk {
            source: ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(cname),
            }],
        });

        self.last_rtcp_sent.store(now_ms, Ordering::Relaxed);
    }

    /// The egress stream needs a key frame; relayed through the Peer to the
    /// Room, which asks the originating Producer.
    pub async fn require_full_frame(&self) {
        if let (Some(consumer), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_consumer_full_frame_required(&consumer).await;
        }
    }

    pub async fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.notifier
            .emit(self.consumer_id, "close", json!({"class": "Consumer"}));

        if let (Some(consumer), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_consumer_closed(&consumer).await;
        }
    }

    pub async fn handle_request(&self, request: &Request) -> Result<Option<Value>> {
        match request.method {
            MethodId::ConsumerDump => Ok(Some(self.dump().await)),

            MethodId::ConsumerDisable => {
                self.disable().await;

                log::debug!("Consumer disabled [consumerId:{}]", self.consumer_id);

                Ok(None)
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    pub async fn dump(&self) -> Value {
        let rtp_parameters = self.rtp_parameters.lock().await.clone();
        let transport_id = self.transport().await.map(|t| t.id());
        let active = !self.disabled.load(Ordering::SeqCst)
            && !self.is_closed()
            && rtp_parameters.is_some();

        json!({
            "consumerId": self.consumer_id,
            "kind": self.kind.to_string(),
            "rtpParameters": rtp_parameters,
            "transportId": transport_id,
            "active": active,
        })
    }
}

/// Converts a millisecond timestamp into the 64-bit NTP format used by
/// Sender Reports.
fn ntp_time(now_ms: u64) -> u64 {
    let secs = now_ms / 1000 + NTP_UNIX_OFFSET_SECS;
    let frac = ((now_ms % 1000) << 32) / 1000;
    (secs << 32) | frac
}
