//! URL validation and multi-URL detection (§6, security-critical).
//!
//! Ported behavior-for-behavior from the original `sanitization.py`
//! test suite: `detect_multiple_urls` / `validate_and_split_url` /
//! `validate_url`.

use crate::error::{AppError, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

fn split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s,;]+").unwrap())
}

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://").unwrap())
}

const MAX_URL_LENGTH: usize = 2048;
const DEFAULT_MAX_URLS: usize = 10;

/// Find every `http(s)://` occurrence in free-form text, after decoding
/// `%20` and splitting on whitespace/comma/semicolon/newline, trailing
/// punctuation stripped. Empty input or input with no URL yields `[]`.
pub fn detect_multiple_urls(input: &str) -> Vec<String> {
    if input.trim().is_empty() {
        return Vec::new();
    }

    let decoded = input.replace("%20", " ");
    let mut found = Vec::new();

    for piece in split_re().split(&decoded) {
        if piece.is_empty() {
            continue;
        }
        let starts: Vec<usize> = scheme_re().find_iter(piece).map(|m| m.start()).collect();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(piece.len());
            let candidate = piece[start..end].trim_end_matches(|c: char| ".,;:!?)]}>\"'".contains(c));
            if !candidate.is_empty() {
                found.push(candidate.to_string());
            }
        }
    }

    found
}

/// Validate free-form input that is expected to contain exactly one
/// URL. Returns `(is_valid, urls_detected, error_message)`, matching
/// the three-way shape the original `validate_and_split_url` returns so
/// a caller can show the user every URL it found even on rejection.
pub fn validate_and_split_url(input: &str, max_urls: usize) -> (bool, Vec<String>, Option<String>) {
    if input.trim().is_empty() {
        return (false, Vec::new(), Some("URL is empty".to_string()));
    }

    let urls = detect_multiple_urls(input);
    if urls.is_empty() {
        return (false, Vec::new(), Some("No valid URLs detected in input".to_string()));
    }

    if urls.len() > max_urls {
        return (
            false,
            urls.clone(),
            Some(format!("Too many URLs detected ({} found, maximum {max_urls})", urls.len())),
        );
    }

    if urls.len() > 1 {
        return (
            false,
            urls.clone(),
            Some(format!(
                "Multiple URLs detected ({}). Please submit them individually via the batch upload endpoint.",
                urls.len()
            )),
        );
    }

    match validate_url(&urls[0]) {
        Ok(valid) => (true, vec![valid], None),
        Err(e) => (false, urls, Some(e.to_string())),
    }
}

/// Validate a single URL: non-empty, bounded length, `http`/`https`
/// scheme only, and not pointed at localhost/link-local/RFC-1918.
pub fn validate_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("URL cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_URL_LENGTH {
        return Err(AppError::Validation(format!(
            "URL is too long (max {MAX_URL_LENGTH} characters)"
        )));
    }

    let parsed = reqwest::Url::parse(trimmed)
        .map_err(|e| AppError::Validation(format!("invalid URL: {e}")))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(AppError::Validation(format!(
            "invalid URL scheme '{scheme}': only http and https are allowed"
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("URL has no host".to_string()))?;

    if is_blocked_host(host) {
        return Err(AppError::Validation(format!(
            "URL host '{host}' resolves to an internal/private address and is not allowed"
        )));
    }

    Ok(trimmed.to_string())
}

/// Defense-in-depth check used by the HTTP fetcher right before
/// connecting: resolve the host and reject if *any* resolved address is
/// internal, guarding against DNS rebinding between validation and fetch.
pub async fn validate_url_resolving(input: &str) -> Result<String> {
    let validated = validate_url(input)?;
    let parsed = reqwest::Url::parse(&validated).expect("already validated");
    let host = parsed.host_str().expect("already validated has host");
    let port = parsed.port_or_known_default().unwrap_or(80);

    if host.parse::<IpAddr>().is_ok() {
        // Already checked as a literal in validate_url.
        return Ok(validated);
    }

    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            for addr in addrs {
                if is_blocked_ip(addr.ip()) {
                    return Err(AppError::Validation(format!(
                        "URL host '{host}' resolves to an internal/private address and is not allowed"
                    )));
                }
            }
            Ok(validated)
        }
        // Resolution failure is an extraction-time concern, not a validation rejection.
        Err(_) => Ok(validated),
    }
}

fn is_blocked_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }
    if let Ok(ip) = normalized.parse::<IpAddr>() {
        return is_blocked_ip(ip);
    }
    false
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || rfc1918_nets().iter().any(|net| net.contains(&v4))
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || unique_local_net().contains(&v6)
                || link_local_v6_net().contains(&v6)
        }
    }
}

fn rfc1918_nets() -> [Ipv4Net; 3] {
    [
        "10.0.0.0/8".parse().unwrap(),
        "172.16.0.0/12".parse().unwrap(),
        "192.168.0.0/16".parse().unwrap(),
    ]
}

fn unique_local_net() -> Ipv6Net {
    "fc00::/7".parse().unwrap()
}

fn link_local_v6_net() -> Ipv6Net {
    "fe80::/10".parse().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_url_detected() {
        let url = "https://www.youtube.com/watch?v=abc123";
        assert_eq!(detect_multiple_urls(url), vec![url]);
    }

    #[test]
    fn two_urls_with_spaces_detected() {
        let url = "https://example.com https://youtube.com/watch?v=123";
        let result = detect_multiple_urls(url);
        assert_eq!(result, vec!["https://example.com", "https://youtube.com/watch?v=123"]);
    }

    #[test]
    fn encoded_spaces_split_correctly() {
        let url = "https://www.youtube.com/watch?v=EoCdf-CKEHk%20%20%20%20https://www.youtube.com/watch?v=TsOOwFBRpKc";
        let result = detect_multiple_urls(url);
        assert_eq!(result.len(), 2);
        assert!(result[0].contains("EoCdf-CKEHk"));
        assert!(result[1].contains("TsOOwFBRpKc"));
    }

    #[test]
    fn newline_separated_urls_detected() {
        let url = "https://example.com\nhttps://youtube.com/watch?v=123\nhttps://wikipedia.org";
        assert_eq!(detect_multiple_urls(url).len(), 3);
    }

    #[test]
    fn empty_string_yields_no_urls() {
        assert!(detect_multiple_urls("").is_empty());
    }

    #[test]
    fn no_urls_in_plain_text() {
        assert!(detect_multiple_urls("just some text without urls").is_empty());
    }

    #[test]
    fn comma_and_semicolon_separated() {
        assert_eq!(detect_multiple_urls("https://example.com,https://youtube.com").len(), 2);
        assert_eq!(detect_multiple_urls("https://example.com;https://youtube.com").len(), 2);
    }

    #[test]
    fn trailing_punctuation_stripped() {
        let result = detect_multiple_urls("https://example.com.");
        assert_eq!(result, vec!["https://example.com"]);
    }

    #[test]
    fn single_valid_url_passes() {
        let url = "https://www.youtube.com/watch?v=abc123";
        let (valid, urls, error) = validate_and_split_url(url, DEFAULT_MAX_URLS);
        assert!(valid);
        assert_eq!(urls, vec![url]);
        assert!(error.is_none());
    }

    #[test]
    fn multiple_urls_rejected_with_list() {
        let url = "https://example.com https://youtube.com/watch?v=123";
        let (valid, urls, error) = validate_and_split_url(url, DEFAULT_MAX_URLS);
        assert!(!valid);
        assert_eq!(urls.len(), 2);
        assert!(error.unwrap().contains("Multiple URLs detected"));
    }

    #[test]
    fn empty_url_rejected() {
        let (valid, urls, error) = validate_and_split_url("", DEFAULT_MAX_URLS);
        assert!(!valid);
        assert!(urls.is_empty());
        assert!(error.unwrap().to_lowercase().contains("empty"));
    }

    #[test]
    fn plain_text_rejected() {
        let (valid, _, error) = validate_and_split_url("just some text", DEFAULT_MAX_URLS);
        assert!(!valid);
        assert!(error.unwrap().contains("No valid URLs detected"));
    }

    #[test]
    fn too_many_urls_rejected() {
        let urls_list: Vec<String> = (0..11).map(|i| format!("https://example{i}.com")).collect();
        let joined = urls_list.join(" ");
        let (valid, _, error) = validate_and_split_url(&joined, 10);
        assert!(!valid);
        let msg = error.unwrap();
        assert!(msg.contains("Too many URLs") || msg.contains("Multiple URLs"));
    }

    #[test]
    fn localhost_rejected_in_split() {
        let (valid, _, error) = validate_and_split_url("http://localhost:8000/admin", DEFAULT_MAX_URLS);
        assert!(!valid);
        let msg = error.unwrap().to_lowercase();
        assert!(msg.contains("internal") || msg.contains("private"));
    }

    #[test]
    fn valid_https_and_http_pass() {
        assert!(validate_url("https://www.example.com/article").is_ok());
        assert!(validate_url("http://www.example.com/article").is_ok());
    }

    #[test]
    fn localhost_rejected() {
        let err = validate_url("http://localhost/admin").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("internal"));
    }

    #[test]
    fn private_ip_rejected() {
        assert!(validate_url("http://192.168.1.1/admin").is_err());
        assert!(validate_url("http://10.1.2.3/x").is_err());
        assert!(validate_url("http://172.16.0.5/x").is_err());
    }

    #[test]
    fn link_local_rejected() {
        assert!(validate_url("http://169.254.169.254/latest/meta-data").is_err());
    }

    #[test]
    fn file_scheme_rejected() {
        let err = validate_url("file:///etc/passwd").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("scheme"));
    }

    #[test]
    fn empty_rejected() {
        assert!(validate_url("").is_err());
    }

    #[test]
    fn too_long_rejected() {
        let long_url = format!("https://example.com/{}", "a".repeat(3000));
        let err = validate_url(&long_url).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("too long"));
    }

    #[test]
    fn real_world_concatenated_bug_scenario() {
        let malformed = "https://www.youtube.com/watch?v=EoCdf-CKEHk%20%20%20%20https://www.youtube.com/watch?v=TsOOwFBRpKc";
        let detected = detect_multiple_urls(malformed);
        assert_eq!(detected.len(), 2);
        let (valid, urls, error) = validate_and_split_url(malformed, DEFAULT_MAX_URLS);
        assert!(!valid);
        assert_eq!(urls.len(), 2);
        assert!(error.unwrap().contains("Multiple URLs detected"));
    }

    #[test]
    fn leading_trailing_whitespace_is_one_url() {
        let url = "  https://www.youtube.com/watch?v=abc123  ";
        assert_eq!(detect_multiple_urls(url).len(), 1);
    }
}
