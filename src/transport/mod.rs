
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::channel::{ChannelNotifier, MethodId, Request};
use crate::error::{Error, Result};
use crate::producer::Producer;

const ICE_UFRAG_LENGTH: usize = 16;
const ICE_PWD_LENGTH: usize = 32;

/// Up-calls a Transport raises into its owning Peer.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// The ICE/DTLS stack became writable.
    async fn on_transport_connected(&self, transport: &Arc<Transport>);
    /// The Transport closed; the receiver must drop every reference to it
    /// before this call returns.
    async fn on_transport_closed(&self, transport: &Arc<Transport>);
    /// The remote endpoint asked for a full frame at the transport level.
    async fn on_transport_full_frame_required(&self, transport: &Arc<Transport>);
    /// A parsed RTCP compound arrived on this Transport.
    async fn on_transport_rtcp_packet(
        &self,
        transport: &Arc<Transport>,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    );
}

/// Egress seam: whatever actually puts RTCP bytes on the wire (the SRTP
/// session in production, a recorder in tests).
#[async_trait]
pub trait RtcpWriter: Send + Sync {
    async fn write_rtcp(&self, data: &Bytes) -> Result<usize>;
}

/// The ICE/DTLS/SRTP session a Peer's streams ride on.
///
/// The wire machinery itself lives behind [`RtcpWriter`] and the connect
/// signal; this object keeps the state the Peer core works against: the
/// ingress SSRC map, the REMB flag, ICE credentials and the delegated
/// control-plane surface.
pub struct Transport {
    transport_id: u32,
    listener: Weak<dyn TransportListener>,
    notifier: Arc<ChannelNotifier>,
    connected: AtomicBool,
    closed: AtomicBool,
    remb: AtomicBool,
    max_bitrate: AtomicU32,
    ice_ufrag: Mutex<String>,
    ice_pwd: Mutex<String>,
    remote_dtls_parameters: Mutex<Option<Value>>,
    dtls_local_role: Mutex<String>,
    // Ingress SSRCs (primary, RTX, FEC) to the Producer claiming them.
    producers: Mutex<HashMap<u32, Weak<Producer>>>,
    rtcp_writer: Mutex<Option<Arc<dyn RtcpWriter>>>,
    weak_self: Weak<Transport>,
}

impl Transport {
    /// Builds a Transport from a `peer.createTransport` request payload.
    pub fn new(
        listener: Weak<dyn TransportListener>,
        notifier: Arc<ChannelNotifier>,
        transport_id: u32,
        options: &Value,
    ) -> Result<Arc<Self>> {
        if !options.is_object() && !options.is_null() {
            return Err(Error::Other(
                "request data is not an object".to_owned(),
            ));
        }

        Ok(Arc::new_cyclic(|weak_self| Transport {
            transport_id,
            listener,
            notifier,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remb: AtomicBool::new(false),
            max_bitrate: AtomicU32::new(0),
            ice_ufrag: Mutex::new(generate_ice_string(ICE_UFRAG_LENGTH)),
            ice_pwd: Mutex::new(generate_ice_string(ICE_PWD_LENGTH)),
            remote_dtls_parameters: Mutex::new(None),
            dtls_local_role: Mutex::new("auto".to_owned()),
            producers: Mutex::new(HashMap::new()),
            rtcp_writer: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn id(&self) -> u32 {
        self.transport_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_remb(&self) -> bool {
        self.remb.load(Ordering::SeqCst)
    }

    /// Asks the remote for REMB congestion feedback on this Transport.
    pub fn enable_remb(&self) {
        if !self.remb.swap(true, Ordering::SeqCst) {
            log::debug!("REMB enabled [transportId:{}]", self.transport_id);
        }
    }

    pub async fn set_rtcp_writer(&self, writer: Arc<dyn RtcpWriter>) {
        let mut rtcp_writer = self.rtcp_writer.lock().await;
        *rtcp_writer = Some(writer);
    }

    /// Registers every SSRC the Producer's RTP parameters claim so ingress
    /// RTCP can be associated with it.
    pub async fn add_producer(&self, producer: &Arc<Producer>) -> Result<()> {
        let rtp_parameters = producer
            .rtp_parameters()
            .await
            .ok_or(Error::ErrProducerNoRtpParameters)?;

        let mut producers = self.producers.lock().await;
        for ssrc in rtp_parameters.ssrcs() {
            if let Some(existing) = producers.get(&ssrc).and_then(Weak::upgrade) {
                if existing.id() != producer.id() {
                    return Err(Error::Other(format!(
                        "ssrc already exists in the Transport [ssrc:{}]",
                        ssrc
                    )));
                }
            }
        }
        for ssrc in rtp_parameters.ssrcs() {
            producers.insert(ssrc, Arc::downgrade(producer));
        }

        Ok(())
    }

    pub async fn remove_producer(&self, producer: &Producer) {
        let mut producers = self.producers.lock().await;
        producers.retain(|_, weak| match weak.upgrade() {
            Some(p) => p.id() != producer.id(),
            None => false,
        });
    }

    /// Resolves the Producer that claims the given ingress SSRC.
    pub async fn get_producer(&self, ssrc: u32) -> Option<Arc<Producer>> {
        let producers = self.producers.lock().await;
        producers.get(&ssrc).and_then(Weak::upgrade)
    }

    /// Hands a serialized RTCP compound to the wire.
    pub async fn send_rtcp_compound_packet(&self, data: &Bytes) {
        let writer = {
            let rtcp_writer = self.rtcp_writer.lock().await;
            rtcp_writer.clone()
        };
        match writer {
            Some(writer) => {
                if let Err(err) = writer.write_rtcp(data).await {
                    log::error!(
                        "RTCP send failed [transportId:{}]: {}",
                        self.transport_id,
                        err
                    );
                }
            }
            None => log::trace!(
                "no RTCP writer, dropping outgoing packet [transportId:{}]",
                self.transport_id
            ),
        }
    }

    /// Invoked by the ICE/DTLS stack once the transport becomes writable.
    pub async fn set_connected(&self) {
        if self.is_closed() || self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(transport), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_transport_connected(&transport).await;
        }
    }

    /// Feeds raw incoming RTCP into the owning Peer's demultiplexer.
    /// Malformed compounds are dropped here; parse failures never propagate.
    pub async fn receive_rtcp(&self, data: &Bytes) {
        let mut buf = &data[..];
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(err) => {
                log::warn!(
                    "dropping invalid RTCP compound [transportId:{}]: {}",
                    self.transport_id,
                    err
                );
                return;
            }
        };

        if let (Some(transport), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_transport_rtcp_packet(&transport, &packets).await;
        }
    }

    /// Asks the Peer to have every video/depth Producer on this Transport
    /// request a full frame upstream.
    pub async fn require_full_frame(&self) {
        if let (Some(transport), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_transport_full_frame_required(&transport).await;
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.notifier
            .emit(self.transport_id, "close", json!({"class": "Transport"}));

        // The Peer clears every Producer/Consumer reference to this Transport
        // before this call returns; nothing may touch it afterwards.
        if let (Some(transport), Some(listener)) =
            (self.weak_self.upgrade(), self.listener.upgrade())
        {
            listener.on_transport_closed(&transport).await;
        }
    }

    pub async fn handle_request(&self, request: &Request) -> Result<Option<Value>> {
        match request.method {
            MethodId::TransportClose => {
                self.close().await;

                log::debug!("Transport closed [transportId:{}]", self.transport_id);

                Ok(None)
            }

            MethodId::TransportDump => Ok(Some(self.dump().await)),

            MethodId::TransportSetRemoteDtlsParameters => {
                let remote_role = request
                    .data
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("auto");
                // Take the opposite role; "auto" leaves us as the client.
                let local_role = match remote_role {
                    "client" => "server",
                    _ => "client",
                };

                {
                    let mut remote = self.remote_dtls_parameters.lock().await;
                    *remote = Some(request.data.clone());
                }
                {
                    let mut role = self.dtls_local_role.lock().await;
                    *role = local_role.to_owned();
                }

                Ok(Some(json!({ "role": local_role })))
            }

            MethodId::TransportSetMaxBitrate => {
                let bitrate = request
                    .data
                    .get("bitrate")
                    .and_then(Value::as_u64)
                    .and_then(|b| u32::try_from(b).ok())
                    .ok_or(Error::ErrMissingBitrate)?;

                self.max_bitrate.store(bitrate, Ordering::SeqCst);

                log::debug!(
                    "Transport max bitrate set [transportId:{}, bitrate:{}]",
                    self.transport_id,
                    bitrate
                );

                Ok(Some(json!({ "bitrate": bitrate })))
            }

            MethodId::TransportChangeUfragPwd => {
                let ufrag = generate_ice_string(ICE_UFRAG_LENGTH);
                let pwd = generate_ice_string(ICE_PWD_LENGTH);

                {
                    let mut ice_ufrag = self.ice_ufrag.lock().await;
                    *ice_ufrag = ufrag.clone();
                }
                {
                    let mut ice_pwd = self.ice_pwd.lock().await;
                    *ice_pwd = pwd.clone();
                }

                Ok(Some(json!({
                    "usernameFragment": ufrag,
                    "password": pwd,
                })))
            }

            _ => Err(Error::ErrUnknownMethod),
        }
    }

    pub async fn dump(&self) -> Value {
        let ice_ufrag = self.ice_ufrag.lock().await.clone();
        let ice_pwd = self.ice_pwd.lock().await.clone();
        let dtls_role = self.dtls_local_role.lock().await.clone();

        json!({
            "transportId": self.transport_id,
            "iceRole": "controlled",
            "iceLocalParameters": {
                "usernameFragment": ice_ufrag,
                "password": ice_pwd,
            },
            "dtlsLocalParameters": {
                "role": dtls_role,
            },
            "connected": self.is_connected(),
            "hasRemb": self.has_remb(),
            "maxBitrate": self.max_bitrate.load(Ordering::SeqCst),
        })
    }
}

fn generate_ice_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
