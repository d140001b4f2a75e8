use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::reception_report::ReceptionReport;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use util::marshal::Marshal;

use crate::channel::{ChannelNotifier, MethodId, Request};
use crate::compound_packet::{
    CompoundPacketBuilder, MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS,
};
use crate::error::{Error, Result};
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::Transport;

/// Up-calls a Producer raises into its owning Peer.
#[async_trait]
pub trait ProducerListener: Send + Sync {
    /// RTP parameters were assigned; the Peer reduces them against its
    /// capabilities and re-registers the Producer on its Transport. A failure
    /// here rejects the originating request.
    async fn on_producer_parameters(&self, producer: &Arc<Producer>) -> Result<()>;
    /// The parameter intake finished; the Peer forwards to the Room.
    async fn on_producer_parameters_done(&self, producer: &Arc<Producer>);
    /// An RTP packet arrived on this ingress stream.
    async fn on_producer_rtp_packet(&self, producer: &Arc<Producer>, packet: &rtp::packet::Packet);
    /// The Producer closed.
    async fn on_producer_closed(&self, producer: &Arc<Producer>);
}

/// An ingress RTP stream: media this peer sends into the SFU.
pub struct Producer {
    producer_id: u32,
    kind: MediaKind,
    listener: Weak<dyn ProducerListener>,
    notifier: Arc<ChannelNotifier>,
    rtp_parameters: Mutex<Option<RtpParameters>>,
    transport: Mutex<Option<Weak<Transport>>>,
    rtp_raw_event: AtomicBool,
    rtp_object_event: AtomicBool,
    received_packets: AtomicU64,
    received_octets: AtomicU64,
    last_sequence_number: AtomicU32,
    last_rtcp_sent: AtomicU64,
    closed: AtomicBool,
    weak_self: Weak<Producer>,
}

impl Producer {
    pub fn new(
        listener: Weak<dyn ProducerListener>,
        notifier: Arc<ChannelNotifier>,
        producer_id: u32,
        kind: MediaKind,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Producer {
            producer_id,
            kind,
            listener,
            notifier,
            rtp_parameters: Mutex::new(None),
            transport: Mutex::new(None),
            rtp_raw_event: AtomicBool::new(false),
            rtp_object_event: AtomicBool::new(false),
            received_packets: AtomicU64::new(0),
            received_octets: AtomicU64::new(0),
            last_sequence_number: AtomicU32::new(0),
            last_rtcp_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn rtp_parameters(&self) -> Option<RtpParameters> {
        self.rtp_parameters.lock().await.clone()
    }

    /// Reduces the assigned parameters against the peer's capabilities,
    /// dropping unsupported codecs, their encodings and header extensions.
    pub(crate) async fn reduce_rtp_parameters(&self, capabilities: &RtpCapabilities) {
        let mut rtp_parameters = self.rtp_parameters.lock().await;
        if let Some(params) = rtp_parameters.as_mut() {
            params.reduce_codecs_and_encodings(capabilities);
            params.reduce_header_extensions(&capabilities.header_extensions);
        }
    }

    pub async fn transport(&self) -> Option<Arc<Transport>> {
        let transport = self.transport.lock().await;
        transport.as_ref().and_then(Weak::upgrade)
    }

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

    /// Assigns the stream's RTP parameters and runs the intake flow through
    /// the Peer. Returns the reduced parameters for the accept payload.
    pub async fn receive(&self, parameters: RtpParameters) -> Result<Value> {
        {
            let mut rtp_parameters = self.rtp_parameters.lock().await;
            *rtp_parameters = Some(parameters);
        }

        let producer = match self.weak_self.upgrade() {
            Some(producer) => producer,
            None => return Err(Error::ErrProducerNotFound),
        };

        if let Some(listener) = self.listener.upgrade() {
            listener.on_producer_parameters(&producer).await?;
            listener.on_producer_parameters_done(&producer).await;
        }

        let rtp_parameters = self.rtp_parameters.lock().await;
        Ok(serde_json::to_value(rtp_parameters.as_ref())?)
    }

    /// Ingress RTP path; accounting plus the Peer up-call that fans the
    /// packet out to Consumers on other peers.
    pub async fn receive_rtp_packet(&self, packet: &rtp::packet::Packet) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_octets
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        self.last_sequence_number
            .store(u32::from(packet.header.sequence_number), Ordering::Relaxed);

        if let (Some(producer), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_producer_rtp_packet(&producer, packet).await;
        }
    }

    /// Asks the remote sender for a full frame by pushing a PLI upstream
    /// through the current Transport.
    pub async fn request_full_frame(&self) {
        let rtp_parameters = self.rtp_parameters.lock().await.clone();
        let media_ssrc = match rtp_parameters
            .as_ref()
            .and_then(|params| params.encodings.first())
            .and_then(|encoding| encoding.ssrc)
        {
            Some(ssrc) => ssrc,
            None => return,
        };
        let transport = match self.transport().await {
            Some(transport) => transport,
            None => return,
        };

        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        match pli.marshal() {
            Ok(data) => {
                log::debug!(
                    "requesting full frame [producerId:{}, mediaSsrc:{}]",
                    self.producer_id,
                    media_ssrc
                );
                transport.send_rtcp_compound_packet(&data).await;
            }
            Err(err) => log::error!("failed to serialize PLI: {}", err),
        }
    }

    /// Appends this stream's reception reports to the compound under
    /// construction. Emission is damped to the per-kind RTCP interval.
    pub async fn get_rtcp(&self, packet: &mut CompoundPacketBuilder, now_ms: u64) {
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

        for encoding in &params.encodings {
            if let Some(ssrc) = encoding.ssrc {
                packet.add_reception_report(ReceptionReport {
                    ssrc,
                    last_sequence_number: self.last_sequence_number.load(Ordering::Relaxed),
                    ..Default::default()
                });
            }
        }

        self.last_rtcp_sent.store(now_ms, Ordering::Relaxed);
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.notifier
            .emit(self.producer_id, "close", json!({"class": "Producer"}));

        if let (Some(producer), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_producer_closed(&producer).await;
        }
    }

    pub async fn handle_request(&self, request: &Request) -> Result<Option<Value>> {
        match request.method {
            MethodId::ProducerClose => {
                self.close().await;

                log::debug!("Producer closed [producerId:{}]", self.producer_id);

                Ok(None)
            }

            MethodId::ProducerDump => Ok(Some(self.dump().await)),

            MethodId::ProducerReceive => {
                let parameters: RtpParameters = serde_json::from_value(request.data.clone())?;
                let data = self.receive(parameters).await?;

                log::debug!("Producer receives [producerId:{}]", self.producer_id);

                Ok(Some(data))
            }

            MethodId::ProducerSetRtpRawEvent => {
                let enabled = request
                    .data
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or(Error::ErrMissingEnabled)?;

                self.rtp_raw_event.store(enabled, Ordering::SeqCst);

                Ok(None)
            }

            MethodId::ProducerSetRtpObjectEvent => {
                let enabled = request
                    .data
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or(Error::ErrMissingEnabled)?;

                self.rtp_object_event.store(enabled, Ordering::SeqCst);

                Ok(None)
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    pub async fn dump(&self) -> Value {
        let rtp_parameters = self.rtp_parameters.lock().await.clone();
        let transport_id = self.transport().await.map(|t| t.id());

        json!({
            "producerId": self.producer_id,
            "kind": self.kind.to_string(),
            "rtpParameters": rtp_parameters,
            "transportId": transport_id,
            "rtpRawEventEnabled": self.rtp_raw_event.load(Ordering::SeqCst),
            "rtpObjectEventEnabled": self.rtp_object_event.load(Ordering::SeqCst),
        })
    }
}
