use regex::Regex;
use std::sync::OnceLock;

use crate::error::NormalizeError;

/// Canonicalizes raw URLs. Implementations must be pure and deterministic.
pub trait UrlNormalizer: Send + Sync {
    fn normalize(&self, url: &str) -> Result<String, NormalizeError>;
}

/// Maps the many spellings of a Stack Overflow post link onto `/q/<id>` or `/a/<id>`,
/// relative to the site root.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackOverflowNormalizer;

fn site_prefix_re() -> &'static Regex {
    static SITE_PREFIX_RE: OnceLock<Regex> = OnceLock::new();
    SITE_PREFIX_RE.get_or_init(|| {
        Regex::new(r"^(?i:https?://(?:www\.)?stackoverflow\.com)").expect("valid site prefix regex")
    })
}

fn answer_in_question_re() -> &'static Regex {
    static ANSWER_IN_QUESTION_RE: OnceLock<Regex> = OnceLock::new();
    ANSWER_IN_QUESTION_RE.get_or_init(|| {
        Regex::new(r"^/(?:questions|q)/\d+/[^/?#]*/(\d+)")
            .expect("valid answer-in-question regex")
    })
}

fn answer_re() -> &'static Regex {
    static ANSWER_RE: OnceLock<Regex> = OnceLock::new();
    ANSWER_RE.get_or_init(|| Regex::new(r"^/(?:a|answers)/(\d+)").expect("valid answer regex"))
}

fn question_re() -> &'static Regex {
    static QUESTION_RE: OnceLock<Regex> = OnceLock::new();
    QUESTION_RE
        .get_or_init(|| Regex::new(r"^/(?:questions|q)/(\d+)").expect("valid question regex"))
}

impl UrlNormalizer for StackOverflowNormalizer {
    fn normalize(&self, url: &str) -> Result<String, NormalizeError> {
        let trimmed = url.trim();
        let path = match site_prefix_re().find(trimmed) {
            Some(m) => &trimmed[m.end()..],
            None => trimmed,
        };

        if let Some(caps) = answer_in_question_re().captures(path) {
            return Ok(format!("/a/{}", &caps[1]));
        }
        if let Some(caps) = answer_re().captures(path) {
            return Ok(format!("/a/{}", &caps[1]));
        }
        if let Some(caps) = question_re().captures(path) {
            return Ok(format!("/q/{}", &caps[1]));
        }

        Err(NormalizeError::NotAPostLink {
            url: url.to_string(),
        })
    }
}
