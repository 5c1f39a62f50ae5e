//! Control socket protocol.
//!
//! Requests and responses are rkyv archives, so the daemon reads a request
//! in place without a parsing step. One request per connection.
//!
//! Frame: `[u32 length, little-endian][rkyv bytes]`

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// Upper bound on a single frame; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    Ping,
    /// Enable a profile, or all profiles and re-arm a failed engine
    Start { profile: Option<String> },
    /// Disable a profile, or shut the daemon down
    Stop { profile: Option<String> },
    Status,
    /// Re-read the configuration file
    Reload,
    Logs { lines: u32 },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Pong { uptime_secs: u64, version: String },
    Ok,
    Error { message: String },
    Status { status: DaemonStatus },
    Logs { lines: Vec<String> },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub domain_suffix: String,
    /// "auto" or "override"
    pub domain_source: String,
    pub engine: EngineInfo,
    pub profiles: Vec<ProfileInfo>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct EngineInfo {
    pub state: String,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub endpoint: String,
    pub restarts: u32,
    pub last_error: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ProfileInfo {
    pub name: String,
    pub enabled: bool,
    pub namespaces: Vec<NamespaceInfo>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct NamespaceInfo {
    pub namespace: String,
    pub status: String,
    pub last_error: Option<String>,
    pub services: Vec<ServiceInfo>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
    pub uptime_secs: Option<u64>,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

/// Message frame for the wire protocol
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::frame(&bytes))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::frame(&bytes))
    }

    pub fn decode_response(bytes: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&Self::aligned(bytes))
    }

    /// Copy a payload into a buffer aligned for archived access.
    pub fn aligned(bytes: &[u8]) -> AlignedVec {
        let mut buf = AlignedVec::with_capacity(bytes.len());
        buf.extend_from_slice(bytes);
        buf
    }

    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }
}
