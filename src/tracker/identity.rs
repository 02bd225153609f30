//! Client identity derivation.

use std::net::IpAddr;

/// Identity used when neither a forwarded address nor a peer is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

fn is_loopback(addr: &str) -> bool {
    match addr.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => addr.eq_ignore_ascii_case("localhost"),
    }
}

/// Derive the client identity for a request.
///
/// The first entry of the proxy's `X-Forwarded-For` header wins unless it is
/// empty or a loopback address (a local health probe or a misconfigured
/// proxy), in which case the transport peer address is used.
pub fn client_id(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> String {
    let forwarded = forwarded_for
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty() && !is_loopback(addr));
    match (forwarded, peer) {
        (Some(addr), _) => addr.to_string(),
        (None, Some(ip)) => ip.to_string(),
        (None, None) => UNKNOWN_CLIENT.to_string(),
    }
}
