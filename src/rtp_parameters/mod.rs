
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Kind of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Depth,
}

impl MediaKind {
    /// Whether streams of this kind are decoded from key frames, i.e. whether
    /// a receiver may need to ask the sender for a full frame.
    pub fn has_full_frames(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Depth)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Depth => "depth",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            "depth" => Ok(MediaKind::Depth),
            _ => Err(Error::ErrInvalidKind),
        }
    }
}

/// RTP capabilities of a peer: the codecs and header extensions it can
/// receive. Assigned once per Peer and reduced by the Room to a subset of the
/// room-wide capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    pub header_extensions: Vec<RtpHeaderExtension>,
    pub fec_mechanisms: Vec<String>,
}

impl RtpCapabilities {
    pub fn supports_codec(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|c| {
            c.name.eq_ignore_ascii_case(&codec.name) && c.clock_rate == codec.clock_rate
        })
    }

    pub fn supports_header_extension(&self, uri: &str) -> bool {
        self.header_extensions.iter().any(|ext| ext.uri == uri)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_id: Option<u16>,
}

/// RTP parameters of a single stream: what a Producer sends or a Consumer
/// forwards. The encodings carry the SSRC claims (primary, RTX and FEC) that
/// feed the per-peer SSRC index and the per-transport ingress map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    pub encodings: Vec<RtpEncodingParameters>,
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<RtcpParameters>,
}

impl RtpParameters {
    /// Whether any encoding claims the given SSRC as its primary, FEC or RTX
    /// source.
    pub fn contains_ssrc(&self, ssrc: u32) -> bool {
        for encoding in &self.encodings {
            if encoding.ssrc == Some(ssrc) {
                return true;
            }
            if let Some(fec) = &encoding.fec {
                if fec.ssrc == ssrc {
                    return true;
                }
            }
            if let Some(rtx) = &encoding.rtx {
                if rtx.ssrc == ssrc {
                    return true;
                }
            }
        }
        false
    }

    /// Every SSRC claimed by these parameters.
    pub fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs = Vec::with_capacity(self.encodings.len());
        for encoding in &self.encodings {
            if let Some(ssrc) = encoding.ssrc {
                ssrcs.push(ssrc);
            }
            if let Some(fec) = &encoding.fec {
                ssrcs.push(fec.ssrc);
            }
            if let Some(rtx) = &encoding.rtx {
                ssrcs.push(rtx.ssrc);
            }
        }
        ssrcs
    }

    /// Drops codecs the given capabilities cannot receive, along with the
    /// encodings that reference them.
    pub fn reduce_codecs_and_encodings(&mut self, capabilities: &RtpCapabilities) {
        let mut removed_payload_types = Vec::new();

        self.codecs.retain(|codec| {
            if capabilities.supports_codec(codec) {
                true
            } else {
                removed_payload_types.push(codec.payload_type);
                false
            }
        });

        self.encodings.retain(|encoding| match encoding.codec_payload_type {
            Some(pt) => !removed_payload_types.contains(&pt),
            None => true,
        });
    }

    /// Drops header extensions whose URI the given set does not include.
    pub fn reduce_header_extensions(&mut self, extensions: &[RtpHeaderExtension]) {
        self.header_extensions
            .retain(|ext| extensions.iter().any(|e| e.uri == ext.uri));
    }

    /// Clock rate of the codec the first encoding refers to.
    pub fn clock_rate(&self) -> Option<u32> {
        let encoding = self.encodings.first()?;
        match encoding.codec_payload_type {
            Some(pt) => self
                .codecs
                .iter()
                .find(|c| c.payload_type == pt)
                .map(|c| c.clock_rate),
            None => self.codecs.first().map(|c| c.clock_rate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpEncodingParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec: Option<RtpFecParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtpRtxParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpFecParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpRtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduced_size: Option<bool>,
}
