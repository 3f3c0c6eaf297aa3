use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::constants::ID_LENGTH;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh 12-character `[a-z0-9]` identifier (request id, stream
/// id, or a randomly-assigned subdomain), drawn from `rand`'s
/// thread-local, cryptographically-seeded generator.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

fn subdomain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap())
}

/// Validate a subdomain label per spec §6:
/// `^[a-z0-9]([a-z0-9-]*[a-z0-9])?$`, 1..63 characters.
pub fn is_valid_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= 63 && subdomain_regex().is_match(s)
}

/// Sanitize a user-supplied subdomain prefix: lowercase, drop anything
/// outside `[a-z0-9-]`, trim leading/trailing hyphens, cap at 63 chars.
/// Falls back to a fresh random id if nothing valid survives.
pub fn sanitize_subdomain_prefix(input: &str) -> String {
    let lowered: String = input
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            (c.is_ascii_alphanumeric() || c == '-').then_some(c)
        })
        .collect();
    let trimmed = lowered.trim_matches('-');
    let truncated: String = trimmed.chars().take(63).collect();
    let truncated = truncated.trim_end_matches('-').to_string();

    if is_valid_subdomain(&truncated) {
        truncated
    } else {
        generate_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..100 {
            let id = generate_id();
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn generated_ids_do_not_collide_in_100_draws() {
        let ids: HashSet<String> = (0..100).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn validator_accepts_valid_labels() {
        assert!(is_valid_subdomain("a"));
        assert!(is_valid_subdomain("my-app-x7k2m4"));
    }

    #[test]
    fn validator_rejects_invalid_labels() {
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-foo"));
        assert!(!is_valid_subdomain("foo-"));
        assert!(!is_valid_subdomain("Foo"));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
    }

    #[test]
    fn sanitize_strips_invalid_characters_and_trims_hyphens() {
        assert_eq!(sanitize_subdomain_prefix("My App!!"), "myapp");
        assert_eq!(sanitize_subdomain_prefix("-leading-and-trailing-"), "leading-and-trailing");
    }

    #[test]
    fn sanitize_falls_back_to_random_id_when_empty() {
        let out = sanitize_subdomain_prefix("---");
        assert_eq!(out.len(), ID_LENGTH);
    }

    #[test]
    fn sanitize_truncates_overlong_input() {
        let out = sanitize_subdomain_prefix(&"a".repeat(100));
        assert!(out.len() <= 63);
        assert!(is_valid_subdomain(&out));
    }
}
