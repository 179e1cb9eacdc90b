use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::str::FromStr;

/// Kind of [SessionDescription].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(Error::Validation(format!(
                "unrecognized session description type: '{other}'"
            ))),
        }
    }
}

/// SDP offer/answer. Exchanged verbatim with the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    sdp_type: SdpType,
    sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }

    pub fn pranswer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Pranswer, sdp)
    }

    pub fn rollback() -> Self {
        Self::new(SdpType::Rollback, String::new())
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }
}

/// Discovered network path, trickled to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    ) -> Self {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index,
        }
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn sdp_mid(&self) -> Option<&str> {
        self.sdp_mid.as_deref()
    }

    pub fn sdp_m_line_index(&self) -> Option<u16> {
        self.sdp_m_line_index
    }

    /// An empty candidate string marks the end of candidates for a media section.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Checks that the candidate is either the end-of-candidates marker or a well formed SDP
    /// `candidate:` attribute:
    ///
    /// ```text
    /// candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.is_end_of_candidates() {
            return Ok(());
        }
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix("candidate:")
            .ok_or_else(|| self.malformed("missing 'candidate:' prefix"))?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(self.malformed("too few fields"));
        }
        if fields[1].parse::<u16>().is_err() {
            return Err(self.malformed("invalid component id"));
        }
        if fields[3].parse::<u32>().is_err() {
            return Err(self.malformed("invalid priority"));
        }
        if fields[5].parse::<u16>().is_err() {
            return Err(self.malformed("invalid port"));
        }
        if fields[6] != "typ" {
            return Err(self.malformed("missing candidate type"));
        }
        Ok(())
    }

    fn malformed(&self, reason: &str) -> Error {
        Error::Ice(format!("malformed candidate <{}>: {reason}", self.candidate))
    }
}

/// Envelope for applications multiplexing session descriptions and candidates over a single
/// signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Signal {
    Sdp(SessionDescription),
    Candidate(IceCandidate),
}

impl From<SessionDescription> for Signal {
    fn from(value: SessionDescription) -> Self {
        Signal::Sdp(value)
    }
}

impl From<IceCandidate> for Signal {
    fn from(value: IceCandidate) -> Self {
        Signal::Candidate(value)
    }
}
