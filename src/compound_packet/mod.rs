
use bytes::{Bytes, BytesMut};
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SourceDescription, SourceDescriptionChunk};
use util::marshal::{Marshal, MarshalSize};

use crate::error::{Error, Result};

/// Longest interval between RTCP compounds for audio-only peers.
pub const MAX_AUDIO_INTERVAL_MS: u64 = 5000;
/// Longest interval between RTCP compounds once video is involved.
pub const MAX_VIDEO_INTERVAL_MS: u64 = 1000;
/// Size of the fixed RTCP send buffer. Compounds that would not fit are
/// refused.
pub const RTCP_BUFFER_SIZE: usize = 65536;

// An RTCP Receiver Report holds at most 31 report blocks.
const MAX_REPORTS_PER_PACKET: usize = 31;

/// Accumulates the RTCP a Peer emits on one Transport during a timer tick:
/// Sender Reports from Consumers, reception reports from Producers, and the
/// SDES chunks that accompany each sender.
///
/// Layout on the wire is Sender Reports first, then a single Receiver Report
/// carrying all reception reports (split only past the 31-block limit), then
/// one SDES packet with all chunks.
#[derive(Debug, Default)]
pub struct CompoundPacketBuilder {
    sender_reports: Vec<SenderReport>,
    reception_reports: Vec<ReceptionReport>,
    sdes_chunks: Vec<SourceDescriptionChunk>,
}

impl CompoundPacketBuilder {
    pub fn new() -> Self {
        CompoundPacketBuilder::default()
    }

    pub fn add_sender_report(&mut self, report: SenderReport) {
        self.sender_reports.push(report);
    }

    pub fn add_reception_report(&mut self, report: ReceptionReport) {
        self.reception_reports.push(report);
    }

    pub fn add_sdes_chunk(&mut self, chunk: SourceDescriptionChunk) {
        self.sdes_chunks.push(chunk);
    }

    pub fn sender_report_count(&self) -> usize {
        self.sender_reports.len()
    }

    pub fn receiver_report_count(&self) -> usize {
        self.reception_reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty()
            && self.reception_reports.is_empty()
            && self.sdes_chunks.is_empty()
    }

    fn receiver_reports(&self) -> Vec<ReceiverReport> {
        self.reception_reports
            .chunks(MAX_REPORTS_PER_PACKET)
            .map(|reports| ReceiverReport {
                ssrc: 0,
                reports: reports.to_vec(),
                ..Default::default()
            })
            .collect()
    }

    fn source_description(&self) -> Option<SourceDescription> {
        if self.sdes_chunks.is_empty() {
            return None;
        }
        Some(SourceDescription {
            chunks: self.sdes_chunks.clone(),
        })
    }

    /// Serialized size of the compound.
    pub fn marshal_size(&self) -> usize {
        let mut size = 0;
        for sr in &self.sender_reports {
            size += sr.marshal_size();
        }
        for rr in self.receiver_reports() {
            size += rr.marshal_size();
        }
        if let Some(sdes) = self.source_description() {
            size += sdes.marshal_size();
        }
        size
    }

    /// Serializes the compound. Refuses compounds that would not fit in the
    /// RTCP send buffer.
    pub fn marshal(&self) -> Result<Bytes> {
        let size = self.marshal_size();
        if size > RTCP_BUFFER_SIZE {
            return Err(Error::ErrRtcpPacketTooBig(size));
        }

        let mut buf = BytesMut::with_capacity(size);
        for sr in &self.sender_reports {
            buf.extend_from_slice(&sr.marshal()?);
        }
        for rr in self.receiver_reports() {
            buf.extend_from_slice(&rr.marshal()?);
        }
        if let Some(sdes) = self.source_description() {
            buf.extend_from_slice(&sdes.marshal()?);
        }

        Ok(buf.freeze())
    }
}
