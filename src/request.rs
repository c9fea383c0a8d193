use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ambient per-request data supplied by the host integration. One
/// `RequestContext` is built per inbound request; every impression
/// recorded during that request shares its `request_fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub controller: String,
    pub action: String,
    /// Primary identifier from the route, when the route carries one.
    pub resource_id: Option<String>,
    /// Authenticated actor; `None` for anonymous traffic.
    pub actor_id: Option<String>,
    pub user_agent: Option<String>,
    pub source_address: String,
    pub referrer: Option<String>,
    pub session_fingerprint: String,
    pub request_fingerprint: String,
    pub params: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn actor_context(&self) -> String {
        format!("{}#{}", self.controller, self.action)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("failed to gather fingerprint entropy: {0}")]
    Entropy(getrandom::Error),
}

/// Stable per-request identifier: Sha256 hex over wall-clock nanos and
/// random bytes. Call once per inbound request, not per impression.
pub fn generate_request_fingerprint() -> Result<String, FingerprintError> {
    let mut seed = [0u8; 16];
    getrandom::getrandom(&mut seed).map_err(FingerprintError::Entropy)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(seed);
    Ok(to_hex(&hasher.finalize()))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
