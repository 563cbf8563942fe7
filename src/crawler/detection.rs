//! Anti-bot response classification
//!
//! Responses are checked in order: status code, then body keywords, then
//! rate-limit headers. The first match wins.

use crate::HarvestError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;

/// Kind of intervention the remote service applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    RateLimit,
    Captcha,
    IpBlock,
    SessionExpired,
    ServerError,
    NetworkError,
}

impl DetectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Captcha => "captcha",
            Self::IpBlock => "ip_block",
            Self::SessionExpired => "session_expired",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
        }
    }

    /// Whether the credential that triggered this should be reported as failed
    pub fn implicates_credential(&self) -> bool {
        matches!(self, Self::Captcha | Self::IpBlock | Self::SessionExpired)
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const BODY_KEYWORDS: &[(&str, DetectionKind)] = &[
    ("captcha", DetectionKind::Captcha),
    ("验证码", DetectionKind::Captcha),
    ("blocked", DetectionKind::IpBlock),
    ("rate limit", DetectionKind::RateLimit),
    ("访问频率", DetectionKind::RateLimit),
    ("too many requests", DetectionKind::RateLimit),
];

const RATE_LIMIT_HEADERS: &[&str] = &["retry-after", "x-ratelimit-remaining"];

/// A classified intervention
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: DetectionKind,
    pub status: Option<u16>,
    /// Seconds from a parseable `Retry-After` header
    pub retry_after: Option<u64>,
    pub detail: String,
}

impl Detection {
    /// How long to back off before trying again
    pub fn suggested_wait(&self) -> Duration {
        match self.kind {
            DetectionKind::RateLimit => Duration::from_secs(self.retry_after.unwrap_or(60)),
            DetectionKind::IpBlock => Duration::from_secs(300),
            DetectionKind::ServerError => Duration::from_secs(30),
            DetectionKind::Captcha | DetectionKind::SessionExpired | DetectionKind::NetworkError => {
                Duration::ZERO
            }
        }
    }

    /// Converts the detection into the error the fetcher surfaces
    pub fn into_error(self, url: &str) -> HarvestError {
        let url = url.to_string();
        match self.kind {
            DetectionKind::RateLimit => HarvestError::RateLimited {
                url,
                retry_after: self.retry_after,
            },
            DetectionKind::Captcha | DetectionKind::IpBlock | DetectionKind::SessionExpired => {
                HarvestError::AuthRejected {
                    url,
                    status: self.status.unwrap_or(200),
                }
            }
            DetectionKind::ServerError => HarvestError::ServerError {
                url,
                status: self.status.unwrap_or(500),
            },
            DetectionKind::NetworkError => HarvestError::Timeout { url },
        }
    }

    /// Reconstructs a detection from an error returned by a feed source
    ///
    /// Auth rejections map by status: 401 is an expired session, 403 an IP
    /// block, anything else a captcha found in an otherwise normal response.
    pub fn from_error(error: &HarvestError) -> Option<Self> {
        let (kind, status, retry_after) = match error {
            HarvestError::RateLimited { retry_after, .. } => {
                (DetectionKind::RateLimit, Some(429), *retry_after)
            }
            HarvestError::AuthRejected { status: 401, .. } => {
                (DetectionKind::SessionExpired, Some(401), None)
            }
            HarvestError::AuthRejected { status: 403, .. } => {
                (DetectionKind::IpBlock, Some(403), None)
            }
            HarvestError::AuthRejected { status, .. } => {
                (DetectionKind::Captcha, Some(*status), None)
            }
            HarvestError::ServerError { status, .. } => {
                (DetectionKind::ServerError, Some(*status), None)
            }
            HarvestError::Timeout { .. } | HarvestError::Http { .. } => {
                (DetectionKind::NetworkError, None, None)
            }
            _ => return None,
        };

        Some(Self {
            kind,
            status,
            retry_after,
            detail: error.to_string(),
        })
    }
}

/// Parses a `Retry-After` header given in seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Classifies a response, returning None when nothing suspicious was found
///
/// Body keywords are only scanned when `scan_body` is set; a successful JSON
/// payload legitimately contains words like "blocked" in user content.
pub fn detect(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    scan_body: bool,
) -> Option<Detection> {
    let retry_after = parse_retry_after(headers);
    let code = status.as_u16();

    let by_status = match code {
        429 => Some(DetectionKind::RateLimit),
        403 => Some(DetectionKind::IpBlock),
        401 => Some(DetectionKind::SessionExpired),
        500 | 502 | 503 => Some(DetectionKind::ServerError),
        _ => None,
    };
    if let Some(kind) = by_status {
        return Some(Detection {
            kind,
            status: Some(code),
            retry_after,
            detail: format!("HTTP {} triggered detection", code),
        });
    }

    if scan_body {
        let lowered = body.to_lowercase();
        if let Some((keyword, kind)) = BODY_KEYWORDS
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword))
        {
            return Some(Detection {
                kind: *kind,
                status: Some(code),
                retry_after,
                detail: format!("response body contains '{}'", keyword),
            });
        }
    }

    RATE_LIMIT_HEADERS
        .iter()
        .find(|name| headers.contains_key(**name))
        .map(|name| Detection {
            kind: DetectionKind::RateLimit,
            status: Some(code),
            retry_after,
            detail: format!("response carries '{}' header", name),
        })
        // A remaining-quota header on a successful response is informational
        .filter(|_| !status.is_success() || retry_after.is_some())
}
