//! Log sanitization for PHI and secrets.
//!
//! Formatted log lines pass through [`SanitizingMakeWriter`] before reaching
//! the sink. Anything shaped like PHI or key material is replaced:
//! - PHI ciphertext envelopes
//! - Record ids (UUIDs)
//! - Emails, phone numbers, SSNs, MRNs
//! - GPS coordinate pairs from transport tracking
//! - Bearer tokens, contextual secrets, long hex strings, PEM private keys
//!
//! Call sites are still expected to log ids and counts only; this is the
//! backstop for values that slip into a message anyway.
//!
//! # Input cap
//!
//! Each call scans at most [`DEFAULT_SANITIZE_MAX_BYTES`] bytes, or the limit
//! given to [`SanitizingMakeWriter::with_max_bytes`]; the rest of an oversized
//! line is dropped and marked `[TRUNCATED]`.

use regex::{Regex, RegexSet};
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;

pub const DEFAULT_SANITIZE_MAX_BYTES: usize = 16 * 1024;

static PHI_PATTERNS: OnceLock<PhiPatterns> = OnceLock::new();

struct Rule {
    regex: Regex,
    replacement: &'static str,
}

struct PhiPatterns {
    any: RegexSet,
    rules: Vec<Rule>,
    pem: Rule,
}

// Applied in order: envelopes first so their base64 bodies are not
// half-matched by the generic secret rules.
const RULES: &[(&str, &str)] = &[
    (
        r"phi1\$(?:det|rnd)\$\d+\$[A-Za-z0-9+/=]+\$[A-Za-z0-9+/=]+",
        "[REDACTED-PHI]",
    ),
    (
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "[REDACTED-ID]",
    ),
    (
        r"(?i)\b[a-z0-9](?:[a-z0-9._%+-]{0,62}[a-z0-9])?@(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}\b",
        "[REDACTED-EMAIL]",
    ),
    (
        r"-?\b\d{1,2}\.\d{4,}\s*,\s*-?\d{1,3}\.\d{4,}\b",
        "[REDACTED-GPS]",
    ),
    (r"\b\d{3}-\d{2}-\d{4}\b", "[REDACTED-SSN]"),
    (r"\bMRN[:\s]?\d{6,10}\b", "[REDACTED-MRN]"),
    (
        r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b",
        "[REDACTED-PHONE]",
    ),
    (
        r"\beyJ[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}\b",
        "[REDACTED-JWT]",
    ),
    (
        r"(?i)\b(?:api[_-]?key|access[_-]?token|secret|password|passphrase|passwd|private[_-]?key|token|key)\b\s*[:=]\s*\S{8,}",
        "[REDACTED-SECRET]",
    ),
    (r"\b[0-9a-fA-F]{32,}\b", "[REDACTED-KEY]"),
];

const PEM_PRIVATE_KEY: &str = r"(?s)-----BEGIN [A-Z0-9 ]{0,40}PRIVATE KEY-----[\s\S]{0,8192}-----END [A-Z0-9 ]{0,40}PRIVATE KEY-----";

fn truncate_to_char_boundary(input: &str, max_bytes: usize) -> (&str, bool) {
    if input.len() <= max_bytes {
        return (input, false);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (&input[..end], true)
}

fn patterns() -> &'static PhiPatterns {
    PHI_PATTERNS.get_or_init(|| {
        let any = RegexSet::new(RULES.iter().map(|(p, _)| *p)).expect("Valid regex set");
        let rules = RULES
            .iter()
            .map(|(pattern, replacement)| Rule {
                regex: Regex::new(pattern).expect("Valid regex"),
                replacement,
            })
            .collect();
        let pem = Rule {
            regex: Regex::new(PEM_PRIVATE_KEY).expect("Valid regex"),
            replacement: "[REDACTED-PEM-PRIVATE-KEY]",
        };

        PhiPatterns { any, rules, pem }
    })
}

/// Replace PHI-shaped substrings.
#[must_use]
pub fn sanitize(input: &str) -> String {
    sanitize_with_limit(input, DEFAULT_SANITIZE_MAX_BYTES)
}

fn sanitize_with_limit(input: &str, max_bytes: usize) -> String {
    let patterns = patterns();
    let (prefix, truncated) = truncate_to_char_boundary(input, max_bytes);

    let matched: Vec<usize> = patterns.any.matches(prefix).into_iter().collect();
    let mut result = prefix.to_string();
    for idx in matched {
        let rule = &patterns.rules[idx];
        result = rule.regex.replace_all(&result, rule.replacement).into_owned();
    }

    if result.contains("-----BEGIN ") {
        let rule = &patterns.pem;
        result = rule.regex.replace_all(&result, rule.replacement).into_owned();
    }

    if truncated {
        result.push_str(" [TRUNCATED]");
    }
    result
}

/// Whether a string contains anything [`sanitize`] would replace.
#[must_use]
pub fn contains_phi(input: &str) -> bool {
    let patterns = patterns();
    let (prefix, _) = truncate_to_char_boundary(input, DEFAULT_SANITIZE_MAX_BYTES);
    patterns.any.is_match(prefix)
        || (prefix.contains("-----BEGIN ")
            && patterns.pem.regex.is_match(prefix))
}

/// `MakeWriter` wrapper that sanitizes each formatted log line.
#[derive(Debug, Clone)]
pub struct SanitizingMakeWriter<M> {
    inner: M,
    max_bytes: usize,
}

impl<M> SanitizingMakeWriter<M> {
    #[must_use]
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            max_bytes: DEFAULT_SANITIZE_MAX_BYTES,
        }
    }

    /// Scan at most `max_bytes` of each line. Zero keeps the default.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        if max_bytes > 0 {
            self.max_bytes = max_bytes;
        }
        self
    }
}

/// Line-buffering writer produced by [`SanitizingMakeWriter`].
pub struct SanitizingWriter<W> {
    inner: W,
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl<W: std::io::Write> SanitizingWriter<W> {
    fn new(inner: W, max_bytes: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            max_bytes,
        }
    }

    fn write_sanitized(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let sanitized = sanitize_with_limit(&String::from_utf8_lossy(bytes), self.max_bytes);
        self.inner.write_all(sanitized.as_bytes())
    }

    fn flush_lines(&mut self) -> std::io::Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.write_sanitized(&line)?;
        }
        Ok(())
    }
}

impl<W: std::io::Write> std::io::Write for SanitizingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        // A formatter that never emits a newline must not grow the buffer forever.
        let hard_cap = self.max_bytes.saturating_mul(2);
        if self.buffer.len() > hard_cap {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
            self.inner.write_all(b"\n")?;
            return Ok(buf.len());
        }

        self.flush_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_lines()?;
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
        }
        self.inner.flush()
    }
}

impl<'a, M> MakeWriter<'a> for SanitizingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = SanitizingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        SanitizingWriter::new(self.inner.make_writer(), self.max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sanitize_envelope() {
        let input = "stored location=phi1$det$1$AAECAwQFBgcICQoL$c2VjcmV0IGNpcGhlcnRleHQ after";
        let sanitized = sanitize(input);
        assert!(sanitized.contains("[REDACTED-PHI]"));
        assert!(!sanitized.contains("c2VjcmV0"));
        assert!(sanitized.ends_with("after"));
    }

    #[test]
    fn test_sanitize_record_id() {
        let sanitized = sanitize("recipient 550e8400-e29b-41d4-a716-446655440000 matched");
        assert_eq!(sanitized, "recipient [REDACTED-ID] matched");
    }

    #[test]
    fn test_sanitize_gps_pair() {
        let sanitized = sanitize("courier at 42.36012, -71.05891 en route");
        assert!(sanitized.contains("[REDACTED-GPS]"));
        assert!(!sanitized.contains("71.05891"));
    }

    #[test]
    fn test_sanitize_contact_details() {
        let sanitized = sanitize("notify jane.doe@hospital.org or 617-555-0142");
        assert!(sanitized.contains("[REDACTED-EMAIL]"));
        assert!(sanitized.contains("[REDACTED-PHONE]"));
    }

    #[test]
    fn test_sanitize_secrets() {
        assert!(sanitize("passphrase=correct-horse-battery").contains("[REDACTED-SECRET]"));
        assert!(sanitize("fp 0123456789abcdef0123456789abcdef").contains("[REDACTED-KEY]"));
    }

    #[test]
    fn test_contains_phi() {
        assert!(contains_phi("id 550e8400-e29b-41d4-a716-446655440000"));
        assert!(!contains_phi("organ status changed to matched"));
    }

    #[test]
    fn test_truncates_large_inputs() {
        let sanitized = sanitize_with_limit("héllo wörld, this is long", 2);
        assert!(sanitized.ends_with("[TRUNCATED]"));
        assert!(sanitized.starts_with('h'));
    }

    #[test]
    fn test_writer_sanitizes_lines() {
        let mut out = Vec::new();
        {
            let mut writer = SanitizingWriter::new(&mut out, DEFAULT_SANITIZE_MAX_BYTES);
            writer
                .write_all(b"user jane@example.org logged in\npartial ")
                .expect("write");
            writer.write_all(b"line\n").expect("write");
            writer.flush().expect("flush");
        }
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "user [REDACTED-EMAIL] logged in\npartial line\n");
    }

    #[test]
    fn test_make_writer_applies_configured_limit() {
        let make = SanitizingMakeWriter::new(()).with_max_bytes(8);
        let mut out = Vec::new();
        {
            let mut writer = SanitizingWriter::new(&mut out, make.max_bytes);
            writer.write_all(b"organ o-1 left the OR\n").expect("write");
        }
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "organ o- [TRUNCATED]");
        assert_eq!(SanitizingMakeWriter::new(()).with_max_bytes(0).max_bytes, DEFAULT_SANITIZE_MAX_BYTES);
    }
}
