use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);

/// Parse a dotted-quad IPv4 literal strictly: exactly four octets, no
/// leading zeros (`"010"` is rejected, not treated as octal), each in
/// `0..=255`.
fn parse_strict_ipv4(s: &str) -> Option<u32> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if part.len() > 1 && part.starts_with('0') {
            return None;
        }
        let value: u32 = part.parse().ok()?;
        if value > 255 {
            return None;
        }
        octets[i] = value as u8;
    }
    Some(u32::from_be_bytes(octets))
}

/// Does `client_ip` match one allowlist `entry`? Handles the three forms:
/// IPv4 CIDR (`a.b.c.d/p`), IPv4 exact, and IPv6 exact (case-insensitive
/// text compare).
fn entry_matches(entry: &str, client_ip: &str) -> bool {
    if let Some((network, prefix)) = entry.split_once('/') {
        let prefix_len: Option<u32> = prefix.parse().ok().filter(|p| *p <= 32);
        return match (parse_strict_ipv4(network), prefix_len, parse_strict_ipv4(client_ip)) {
            (Some(network_bits), Some(p), Some(client_bits)) => {
                let mask: u32 = if p == 0 { 0 } else { 0xFFFF_FFFFu32 << (32 - p) };
                (client_bits & mask) == (network_bits & mask)
            }
            _ => false,
        };
    }

    match (parse_strict_ipv4(entry), parse_strict_ipv4(client_ip)) {
        (Some(a), Some(b)) => a == b,
        _ => entry.eq_ignore_ascii_case(client_ip),
    }
}

/// `is_ip_allowed` from spec §4.4. An empty allowlist allows everyone;
/// entries are whitespace-trimmed before comparison.
pub fn is_ip_allowed(client_ip: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let client_ip = client_ip.trim();
    allowlist
        .iter()
        .any(|raw| entry_matches(raw.trim(), client_ip))
}

/// Derive the client IP for access-control purposes: `cf-connecting-ip` if
/// present, else the first token of `x-forwarded-for`, else the peer
/// address.
pub fn derive_client_ip(
    cf_connecting_ip: Option<&str>,
    x_forwarded_for: Option<&str>,
    peer_addr: IpAddr,
) -> String {
    if let Some(ip) = cf_connecting_ip.map(str::trim).filter(|s| !s.is_empty()) {
        return ip.to_string();
    }
    if let Some(first) = x_forwarded_for.and_then(|xff| xff.split(',').next()) {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    peer_addr.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

/// Sliding-window rate limiter, one instance per tunnel. `limit` is
/// requests per 60-second window; `0` disables enforcement (`check`
/// always allows).
pub struct RateLimiter {
    limit: u32,
    buckets: DashMap<String, (u32, Instant)>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
        }
    }

    /// The configured requests-per-window cap (`0` means disabled).
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, ip: &str) -> RateLimitDecision {
        self.check_at(ip, Instant::now())
    }

    /// Same as `check`, but with an explicit clock reading — used by tests
    /// to simulate time advancing without sleeping.
    pub fn check_at(&self, ip: &str, now: Instant) -> RateLimitDecision {
        if self.limit == 0 {
            return RateLimitDecision::Allowed;
        }

        let mut bucket = self.buckets.entry(ip.to_string()).or_insert((0, now));
        if now.saturating_duration_since(bucket.1) >= WINDOW {
            bucket.0 = 0;
            bucket.1 = now;
        }

        if bucket.0 < self.limit {
            bucket.0 += 1;
            RateLimitDecision::Allowed
        } else {
            let elapsed = now.saturating_duration_since(bucket.1);
            let remaining = WINDOW.saturating_sub(elapsed);
            let retry_after = remaining.as_secs_f64().ceil().max(1.0) as u64;
            RateLimitDecision::Denied {
                retry_after_seconds: retry_after,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everyone() {
        assert!(is_ip_allowed("203.0.113.1", &[]));
    }

    #[test]
    fn cidr_membership() {
        let list = vec!["10.0.0.0/8".to_string()];
        assert!(is_ip_allowed("10.255.255.255", &list));
        assert!(!is_ip_allowed("11.0.0.0", &list));

        let everything = vec!["0.0.0.0/0".to_string()];
        assert!(is_ip_allowed("1.2.3.4", &everything));
        assert!(is_ip_allowed("255.255.255.255", &everything));

        let exact = vec!["192.168.1.5/32".to_string()];
        assert!(is_ip_allowed("192.168.1.5", &exact));
        assert!(!is_ip_allowed("192.168.1.6", &exact));
    }

    #[test]
    fn cidr_rejects_invalid_prefix_and_non_ipv4_client() {
        let bad_prefix = vec!["10.0.0.0/33".to_string()];
        assert!(!is_ip_allowed("10.0.0.1", &bad_prefix));

        let v4_cidr = vec!["10.0.0.0/8".to_string()];
        assert!(!is_ip_allowed("::1", &v4_cidr));
    }

    #[test]
    fn ipv6_exact_match_is_case_insensitive() {
        let list = vec!["::1".to_string()];
        assert!(is_ip_allowed("::1", &list));

        let list = vec!["2001:DB8::1".to_string()];
        assert!(is_ip_allowed("2001:db8::1", &list));
    }

    #[test]
    fn ipv4_exact_match_rejects_leading_zeros() {
        let list = vec!["010.0.0.1".to_string()];
        assert!(!is_ip_allowed("10.0.0.1", &list));
    }

    #[test]
    fn xff_parsing_prefers_first_token_and_cf_header_wins() {
        assert_eq!(
            derive_client_ip(
                None,
                Some("203.0.113.50, 70.41.3.18"),
                "9.9.9.9".parse().unwrap()
            ),
            "203.0.113.50"
        );
        assert_eq!(
            derive_client_ip(
                Some("198.51.100.1"),
                Some("203.0.113.50, 70.41.3.18"),
                "9.9.9.9".parse().unwrap()
            ),
            "198.51.100.1"
        );
        assert_eq!(
            derive_client_ip(None, None, "9.9.9.9".parse().unwrap()),
            "9.9.9.9"
        );
    }

    #[test]
    fn rate_limiter_allows_up_to_cap_then_denies() {
        let limiter = RateLimiter::new(3);
        let start = Instant::now();
        assert_eq!(limiter.check_at("1.1.1.1", start), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("1.1.1.1", start), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("1.1.1.1", start), RateLimitDecision::Allowed);
        match limiter.check_at("1.1.1.1", start) {
            RateLimitDecision::Denied { retry_after_seconds } => {
                assert!(retry_after_seconds >= 1);
            }
            RateLimitDecision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn rate_limiter_resets_after_window() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        assert_eq!(limiter.check_at("2.2.2.2", start), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check_at("2.2.2.2", start),
            RateLimitDecision::Denied { .. }
        ));
        let later = start + Duration::from_secs(61);
        assert_eq!(limiter.check_at("2.2.2.2", later), RateLimitDecision::Allowed);
    }

    #[test]
    fn rate_limiter_tracks_ips_independently() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert_eq!(limiter.check_at("3.3.3.3", now), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("4.4.4.4", now), RateLimitDecision::Allowed);
    }

    #[test]
    fn zero_limit_disables_enforcement() {
        let limiter = RateLimiter::new(0);
        let now = Instant::now();
        for _ in 0..1000 {
            assert_eq!(limiter.check_at("5.5.5.5", now), RateLimitDecision::Allowed);
        }
    }
}
