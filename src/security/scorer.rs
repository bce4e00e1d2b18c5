use axum::http::{header, HeaderMap, Method};
use regex::bytes::Regex;
use std::sync::LazyLock;

use super::{FindingKind, SecurityFinding, Severity};
use crate::models::{ExchangeRequest, ExchangeResponse};

pub const BASE_SCORE: i32 = 100;

/// Score and findings for one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityReport {
    pub score: i32,
    pub findings: Vec<SecurityFinding>,
}

impl SecurityReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}

struct SensitivePattern {
    label: &'static str,
    regex: Regex,
}

// SAFETY: .expect() on compile-time literal patterns, verified by tests.
static SENSITIVE_PATTERNS: LazyLock<Vec<SensitivePattern>> = LazyLock::new(|| {
    [
        ("password", r#"(?i)"password"\s*:\s*".+""#),
        ("api_key", r#"(?i)"api_key"\s*:\s*".+""#),
        ("secret", r#"(?i)"secret"\s*:\s*".+""#),
        ("token", r#"(?i)"token"\s*:\s*".{20,}""#),
        ("credit_card", r"\b(?:\d[ -]*?){13,16}\b"),
    ]
    .into_iter()
    .map(|(label, pattern)| SensitivePattern {
        label,
        regex: Regex::new(pattern).expect("sensitive data pattern must compile"),
    })
    .collect()
});

const STATE_CHANGING_METHODS: [Method; 4] = [Method::POST, Method::PUT, Method::DELETE, Method::PATCH];

const FINGERPRINT_HEADERS: [&str; 3] = ["x-powered-by", "x-aspnet-version", "x-aspnetmvc-version"];

fn check_sensitive_data(response: &ExchangeResponse) -> Vec<SecurityFinding> {
    SENSITIVE_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(&response.body))
        .map(|p| {
            SecurityFinding::new(
                FindingKind::SensitiveDataExposure,
                Severity::Critical,
                format!("A field resembling a \"{}\" was found in the API response body.", p.label),
                "Never return passwords, tokens, API keys or card numbers in API responses. \
                 Map entities to response types that exclude these fields.",
            )
        })
        .collect()
}

fn check_missing_authentication(request: &ExchangeRequest) -> Vec<SecurityFinding> {
    if STATE_CHANGING_METHODS.contains(&request.method)
        && !request.headers.contains_key(header::AUTHORIZATION)
    {
        return vec![SecurityFinding::new(
            FindingKind::MissingAuthentication,
            Severity::High,
            format!(
                "A {} request was made to \"{}\" without an Authorization header.",
                request.method, request.path
            ),
            "Protect all state-changing endpoints (POST, PUT, PATCH, DELETE) with authentication \
             and authorization.",
        )];
    }
    Vec::new()
}

fn check_server_info_leak(response: &ExchangeResponse) -> Vec<SecurityFinding> {
    FINGERPRINT_HEADERS
        .iter()
        .filter_map(|name| {
            let value = response.headers.get(*name)?;
            Some(SecurityFinding::new(
                FindingKind::ServerInfoLeak,
                Severity::Medium,
                format!(
                    "The '{}' header reveals server technology: {}.",
                    name,
                    String::from_utf8_lossy(value.as_bytes())
                ),
                format!(
                    "Remove the '{name}' header in your web server or framework settings."
                ),
            ))
        })
        .collect()
}

fn check_best_practices(request: &ExchangeRequest, response: &ExchangeResponse) -> Vec<SecurityFinding> {
    let mut findings = Vec::new();

    if request.method == Method::GET && !has_header(&response.headers, header::CACHE_CONTROL) {
        findings.push(SecurityFinding::new(
            FindingKind::MissingBestPractice,
            Severity::Low,
            "The GET response is missing a Cache-Control header.",
            "Add a Cache-Control header to GET responses to control caching by clients and intermediaries.",
        ));
    }

    if !has_header(&response.headers, header::CONTENT_SECURITY_POLICY) {
        findings.push(SecurityFinding::new(
            FindingKind::MissingBestPractice,
            Severity::Medium,
            "The Content-Security-Policy header is missing.",
            "Send a Content-Security-Policy header to mitigate cross-site scripting and injection attacks.",
        ));
    }

    findings
}

fn has_header(headers: &HeaderMap, name: header::HeaderName) -> bool {
    headers.contains_key(name)
}

/// Score a set of findings: 100 minus each finding's deduction, floored at 0
pub fn score_for(findings: &[SecurityFinding]) -> i32 {
    let deducted: i32 = findings.iter().map(|f| f.severity.deduction()).sum();
    (BASE_SCORE - deducted).max(0)
}

/// Run every check against a request/response pair
///
/// Checks are independent and all of them always run; the score is derived
/// from the combined finding list.
pub fn analyze(request: &ExchangeRequest, response: &ExchangeResponse) -> SecurityReport {
    let mut findings = check_sensitive_data(response);
    findings.extend(check_missing_authentication(request));
    findings.extend(check_server_info_leak(response));
    findings.extend(check_best_practices(request, response));

    SecurityReport {
        score: score_for(&findings),
        findings,
    }
}
