//! Host name helpers

use std::net::{IpAddr, UdpSocket};

/// Extract the bare host from a URL or `host[:port]` string
#[must_use]
pub fn host_of(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if let Ok(parsed) = url::Url::parse(trimmed)
        && let Some(host) = parsed.host_str()
    {
        return host.trim_start_matches('[').trim_end_matches(']').to_string();
    }
    if let Ok(ip) = trimmed.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.to_string();
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
        _ => trimmed.to_string(),
    }
}

#[must_use]
pub fn is_ip(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// Whether `host` is a syntactically valid DNS name with at least two labels
#[must_use]
pub fn is_valid_domain(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 || is_ip(host) {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }) && labels
        .last()
        .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_alphabetic()))
}

/// Local address used for outbound traffic; no packet is sent
#[must_use]
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://nexus.example.com:8091"), "nexus.example.com");
        assert_eq!(host_of("10.0.0.5:8091"), "10.0.0.5");
        assert_eq!(host_of("[::1]:8091"), "::1");
        assert_eq!(host_of("nexus.example.com"), "nexus.example.com");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("nexus.example.com"));
        assert!(is_valid_domain("a-b.io"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("10.0.0.1"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("bad_name.example.com"));
    }
}
