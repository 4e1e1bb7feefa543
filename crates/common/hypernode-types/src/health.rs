use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Length of the anti-spam window per requester-class.
pub const HEALTH_CHECK_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Pass,
    Fail,
    Throttled,
}

impl HealthVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Throttled => "throttled",
        }
    }
}

/// Inbound verification request. Anyone may send one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Challenge echoed back in the answer.
    pub nonce: String,

    /// Optional claims the verifier wants confirmed against the advertised capability.
    #[serde(default)]
    pub expect_gpu_model: Option<String>,
    #[serde(default)]
    pub expect_min_vram_mb: Option<u64>,
}

/// One accepted (non-throttled) check. The log of these is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub checked_at: DateTime<Utc>,
    pub requester_id: String,
    pub passed: bool,
    pub bucket_key: String,
}

/// Requester-class of a peer address: its IPv4 /24 or IPv6 /64 network.
///
/// Derived from the connection, not from anything the requester writes in its
/// probe, so renaming itself does not buy a requester a fresh window.
pub fn requester_class(peer: IpAddr) -> String {
    match peer {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.0/24", a, b, c)
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => requester_class(IpAddr::V4(v4)),
            None => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
            }
        },
    }
}
