//! PII detection and redaction.
//!
//! Regex pattern table applied in a fixed order, each pattern rewriting the
//! evolving string so placeholders are never re-scanned by later patterns.
//! Credit-card candidates must pass a Luhn check before they count; digit
//! runs that fail the checksum are left untouched.

use regex::{Captures, Regex};
use serde::Serialize;

struct PiiPattern {
    kind: &'static str,
    placeholder: &'static str,
    /// Require a valid Luhn checksum before treating a match as a hit.
    luhn: bool,
    regex: Regex,
}

/// Findings from one scan.
#[derive(Debug, Clone, Serialize)]
pub struct PiiScan {
    /// Distinct PII types found, in pattern order.
    pub detections: Vec<&'static str>,
    /// Total number of individual matches.
    pub count: usize,
    /// Input with placeholders substituted; `None` when nothing matched.
    #[serde(skip)]
    pub redacted: Option<String>,
}

impl PiiScan {
    pub fn clean(&self) -> bool {
        self.count == 0
    }
}

pub struct PiiScanner {
    patterns: Vec<PiiPattern>,
}

impl PiiScanner {
    pub fn new() -> Self {
        let table: &[(&str, &str, bool, &str)] = &[
            // SSN: 123-45-6789 or 123 45 6789
            ("SSN", "[REDACTED_SSN]", false, r"\b\d{3}[-\s]\d{2}[-\s]\d{4}\b"),
            // Credit card: 13-19 digits, optionally separated by spaces or
            // dashes; only Luhn-valid sequences count
            ("CREDIT_CARD", "[REDACTED_CC]", true, r"\b(?:\d[-\s]?){12,18}\d\b"),
            (
                "EMAIL",
                "[REDACTED_EMAIL]",
                false,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            ),
            // US phone: separators required so bare digit strings don't match
            (
                "PHONE",
                "[REDACTED_PHONE]",
                false,
                r"(?:\+1[-.\s])?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b",
            ),
            // IPv4 with octet range enforced, so version strings don't match
            (
                "IP_ADDRESS",
                "[REDACTED_IP]",
                false,
                r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b",
            ),
        ];

        let patterns = table
            .iter()
            .map(|(kind, placeholder, luhn, pattern)| PiiPattern {
                kind,
                placeholder,
                luhn: *luhn,
                regex: Regex::new(pattern).expect("pii pattern compiles"),
            })
            .collect();

        Self { patterns }
    }

    pub fn scan(&self, text: &str) -> PiiScan {
        if text.trim().is_empty() {
            return PiiScan {
                detections: Vec::new(),
                count: 0,
                redacted: None,
            };
        }

        let mut detections: Vec<&'static str> = Vec::new();
        let mut count = 0usize;
        let mut current = text.to_string();

        for pattern in &self.patterns {
            let rewritten = pattern.regex.replace_all(&current, |caps: &Captures| {
                let matched = &caps[0];
                if pattern.luhn && !luhn_check(matched) {
                    return matched.to_string();
                }
                count += 1;
                if !detections.contains(&pattern.kind) {
                    detections.push(pattern.kind);
                }
                pattern.placeholder.to_string()
            });
            current = rewritten.into_owned();
        }

        PiiScan {
            detections,
            count,
            redacted: (count > 0).then_some(current),
        }
    }
}

impl Default for PiiScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Luhn checksum: right to left, double every second digit, subtract 9 when
/// the doubled digit exceeds 9, accept iff the sum is divisible by 10.
pub fn luhn_check(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luhn_accepts_valid_cards() {
        for number in ["4539148803436467", "4111111111111111", "5500 0000 0000 0004"] {
            assert!(luhn_check(number), "{number}");
        }
    }

    #[test]
    fn luhn_rejects_invalid_sequences() {
        assert!(!luhn_check("4111111111111112"));
        assert!(!luhn_check("1234567890123456"));
        // Out of card-number length range
        assert!(!luhn_check("123456789012"));
        assert!(!luhn_check("12345678901234567890"));
    }

    #[test]
    fn redacts_ssn() {
        let scanner = PiiScanner::new();
        let scan = scanner.scan("My SSN is 123-45-6789.");
        assert_eq!(scan.detections, vec!["SSN"]);
        assert_eq!(scan.redacted.as_deref(), Some("My SSN is [REDACTED_SSN]."));
    }

    #[test]
    fn redacts_valid_card_and_ssn_together() {
        let scanner = PiiScanner::new();
        let scan = scanner.scan("My SSN is 123-45-6789 and my card is 4539 1488 0343 6467.");
        assert_eq!(scan.detections, vec!["SSN", "CREDIT_CARD"]);
        assert_eq!(scan.count, 2);
        assert_eq!(
            scan.redacted.as_deref(),
            Some("My SSN is [REDACTED_SSN] and my card is [REDACTED_CC].")
        );
    }

    #[test]
    fn luhn_invalid_digits_are_not_redacted() {
        let scanner = PiiScanner::new();
        let scan = scanner.scan("Order number 1234567890123456 is ready.");
        assert!(scan.clean());
        assert!(scan.redacted.is_none());
    }

    #[test]
    fn redacts_email_phone_and_ip() {
        let scanner = PiiScanner::new();
        let scan = scanner.scan("Mail user@example.com or call (555) 867-5309 from 10.0.0.1.");
        assert_eq!(scan.detections, vec!["EMAIL", "PHONE", "IP_ADDRESS"]);
        assert_eq!(
            scan.redacted.as_deref(),
            Some("Mail [REDACTED_EMAIL] or call [REDACTED_PHONE] from [REDACTED_IP].")
        );
    }

    #[test]
    fn version_strings_are_not_ip_addresses() {
        let scanner = PiiScanner::new();
        assert!(scanner.scan("upgrade to 1.2.3 now").clean());
        assert!(scanner.scan("address 999.1.1.1 is invalid").clean());
    }

    #[test]
    fn redaction_is_idempotent() {
        let scanner = PiiScanner::new();
        let input = "SSN 123-45-6789, card 4111 1111 1111 1111, mail a@b.co, ip 192.168.0.1";
        let once = scanner.scan(input).redacted.unwrap();
        let again = scanner.scan(&once);
        assert!(again.clean());
        assert!(again.redacted.is_none());
    }

    #[test]
    fn empty_input_is_clean() {
        let scanner = PiiScanner::new();
        assert!(scanner.scan("").clean());
        assert!(scanner.scan("   \n").clean());
    }

    #[test]
    fn count_tracks_every_match() {
        let scanner = PiiScanner::new();
        let scan = scanner.scan("a@b.co and c@d.org");
        assert_eq!(scan.detections, vec!["EMAIL"]);
        assert_eq!(scan.count, 2);
    }
}
