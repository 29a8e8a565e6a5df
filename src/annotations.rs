use regex::Regex;
use std::sync::OnceLock;

use crate::error::PreconditionError;
use crate::models::{AnnotationPatch, Anomaly, Event};
use crate::normalize::UrlNormalizer;

fn query_re() -> &'static Regex {
    static QUERY_RE: OnceLock<Regex> = OnceLock::new();
    QUERY_RE.get_or_init(|| Regex::new(r"\?[^#]*").expect("valid query regex"))
}

fn fragment_identifier_re() -> &'static Regex {
    static FRAGMENT_IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();
    FRAGMENT_IDENTIFIER_RE.get_or_init(|| Regex::new(r"#.*").expect("valid fragment regex"))
}

/// Query string of `url` without the leading `?`.
///
/// Lexical scan only: the first `?` up to the next `#` (or the end), wherever
/// they occur. Dirty URLs are split the same way a browser log would show them.
pub fn extract_query(url: &str) -> Option<String> {
    query_re().find(url).map(|m| m.as_str()[1..].to_string())
}

/// Everything after the first `#`, stray `#` and `?` included
pub fn extract_fragment_identifier(url: &str) -> Option<String> {
    fragment_identifier_re()
        .find(url)
        .map(|m| m.as_str()[1..].to_string())
}

/// Same page reached again from itself
pub fn is_page_refresh(previous: &Event, event: &Event) -> bool {
    previous.event_target == event.event_source
        && previous.url == event.url
        && previous.url.starts_with(&event.referrer)
}

/// Pass 2 result for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationOutcome {
    /// One patch per input event, in input order
    pub patches: Vec<AnnotationPatch>,
    pub anomalies: Vec<Anomaly>,
}

/// Post URLs seen so far in a session, in first-seen order
#[derive(Default)]
struct AccessedPosts<'a> {
    entries: Vec<(&'a str, Option<String>)>,
}

impl<'a> AccessedPosts<'a> {
    /// Re-visits keep their original position but take the newest normalized URL
    fn record(&mut self, url: &'a str, normalized: Option<String>) {
        match self.entries.iter_mut().find(|(seen, _)| *seen == url) {
            Some(entry) => entry.1 = normalized,
            None => self.entries.push((url, normalized)),
        }
    }

    /// Normalized URL of the last recorded post whose URL starts with `referrer`.
    /// Outer `None` means nothing matched.
    fn resolve(&self, referrer: &str) -> Option<Option<String>> {
        self.entries
            .iter()
            .filter(|(url, _)| url.starts_with(referrer))
            .last()
            .map(|(_, normalized)| normalized.clone())
    }
}

/// Annotates one already-rooted session.
///
/// Post views get a normalized URL, and their referrer is resolved against
/// the posts seen earlier in the session, which recovers referrers that the
/// client truncated (e.g. `/questions/35352638/react-router-how-to` for
/// `/questions/35352638/react-router-how-to-get-parameter-value-from-url/48256676`).
/// A normalizer rejection only skips that event's normalized URL.
pub fn annotate_sequence(
    root_event_id: i64,
    events: &[Event],
    normalizer: &dyn UrlNormalizer,
) -> Result<AnnotationOutcome, PreconditionError> {
    if events.is_empty() {
        return Err(PreconditionError::EmptyGroup {
            key: root_event_id.to_string(),
        });
    }
    if let Some(other) = events
        .iter()
        .find(|e| e.root_event_id != Some(root_event_id))
    {
        return Err(PreconditionError::MixedRoots {
            event_id: other.id,
            expected: root_event_id,
            found: other.root_event_id,
        });
    }

    let mut patches: Vec<AnnotationPatch> =
        events.iter().map(|e| AnnotationPatch::new(e.id)).collect();
    let mut anomalies = Vec::new();
    let mut accessed_posts = AccessedPosts::default();

    for (idx, event) in events.iter().enumerate() {
        if event.targets_post() {
            let normalized = match normalizer.normalize(&event.url) {
                Ok(url) => Some(url),
                Err(e) => {
                    anomalies.push(Anomaly::UnnormalizableUrl {
                        event_id: event.id,
                        reason: e.to_string(),
                    });
                    None
                }
            };
            patches[idx].normalized_url = normalized.clone();
            accessed_posts.record(&event.url, normalized);

            if let Some(referrer) = accessed_posts.resolve(&event.referrer) {
                patches[idx].normalized_referrer = referrer;
            }
        }

        if idx > 0 {
            let page_refresh = is_page_refresh(&events[idx - 1], event);
            patches[idx].page_refresh = page_refresh;

            // a session made only of refreshes must flag its first event too
            if idx == 1 && page_refresh {
                patches[0].page_refresh = true;
            }
        }

        patches[idx].query = extract_query(&event.url);
        patches[idx].fragment_identifier = extract_fragment_identifier(&event.url);
    }

    Ok(AnnotationOutcome { patches, anomalies })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{event, rooted, with_route};
    use crate::normalize::StackOverflowNormalizer;

    fn annotate(events: &[Event]) -> AnnotationOutcome {
        annotate_sequence(1, events, &StackOverflowNormalizer).unwrap()
    }

    /// Applies the patches back onto the events, as the store would
    fn apply(events: &[Event], outcome: &AnnotationOutcome) -> Vec<Event> {
        events
            .iter()
            .zip(&outcome.patches)
            .map(|(e, p)| Event {
                normalized_url: p.normalized_url.clone(),
                normalized_referrer: p.normalized_referrer.clone(),
                page_refresh: p.page_refresh,
                query: p.query.clone(),
                fragment_identifier: p.fragment_identifier.clone(),
                ..e.clone()
            })
            .collect()
    }

    #[test]
    fn test_query_extraction() {
        let cases = [
            (
                "/questions/1082130/how-do-i-remove-a-mysql-database?s=1|110.8094",
                "s=1|110.8094",
            ),
            (
                "/questions/38997881/selenium-tests-dont-work-in-ie11?noredirect=1&lq=1",
                "noredirect=1&lq=1",
            ),
            (
                "/search?q=%D0%BF%D0%B5%D1%80%D0%B5%D0%B2%D0%BE%D0%B4+%D0%BD%D0%B0",
                "q=%D0%BF%D0%B5%D1%80%D0%B5%D0%B2%D0%BE%D0%B4+%D0%BD%D0%B0",
            ),
            (
                "/questions/3625659/java-io-ioexception-server-returns-http-response-code-505?answertab=active#23tab-top",
                "answertab=active",
            ),
            (
                "/questions/tagged/ide?pageSize=-1#22%20OR%203%2b877-877-1=0%2b0%2b0%2b1%20--%20&sort=newest",
                "pageSize=-1",
            ),
            (
                "/search?q=[google-app-engine]+video+streaming",
                "q=[google-app-engine]+video+streaming",
            ),
        ];
        for (url, expected) in cases {
            assert_eq!(extract_query(url).as_deref(), Some(expected), "{url}");
        }
    }

    #[test]
    fn test_fragment_identifier_extraction() {
        let cases = [
            (
                "/questions/3625659/java-io-ioexception-server-returns-http-response-code-505?answertab=active#23tab-top",
                "23tab-top",
            ),
            (
                "/questions/30038675/plupload?answertab=active&from=en&to=zh-CHS&tfr=web&domainType=sogou#22",
                "22",
            ),
            // malformed URLs are split lexically
            (
                "/questions/tagged/ide?pageSize=-1#22%20OR%203%2b877-877-1=0%2b0%2b0%2b1%20--%20&sort=newest",
                "22%20OR%203%2b877-877-1=0%2b0%2b0%2b1%20--%20&sort=newest",
            ),
            (
                "/questions/tagged/sql?page=5&pageSize=15&sort=%f0''%f0#22#22",
                "22#22",
            ),
            (
                "/users?filter=week&page=3&tab=reputation'#22()%26%25<acx><ScRiPt%20>ph7t(9084)</ScRiPt>",
                "22()%26%25<acx><ScRiPt%20>ph7t(9084)</ScRiPt>",
            ),
        ];
        for (url, expected) in cases {
            assert_eq!(extract_fragment_identifier(url).as_deref(), Some(expected), "{url}");
        }
    }

    #[test]
    fn test_query_and_fragment_absent() {
        assert_eq!(extract_query("/q/1"), None);
        assert_eq!(extract_fragment_identifier("/q/1"), None);
        assert_eq!(extract_query("/q/1?x=1#frag").as_deref(), Some("x=1"));
        assert_eq!(extract_fragment_identifier("/q/1?x=1#frag").as_deref(), Some("frag"));
        // '?' inside the fragment still counts as the query start
        assert_eq!(extract_query("/q/1#a?b").as_deref(), Some("b"));
    }

    #[test]
    fn test_refresh_of_first_event_is_flagged() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/q/1"), "Search", "Post", "/search"), 1),
            rooted(with_route(event(2, "u", 5, "/q/1"), "Post", "Post", "/q/1"), 1),
        ];
        let outcome = annotate(&events);

        assert!(outcome.patches[1].page_refresh);
        assert!(outcome.patches[0].page_refresh);
    }

    #[test]
    fn test_refresh_later_in_session_leaves_first_event() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/q/1"), "Search", "Post", "/search"), 1),
            rooted(with_route(event(2, "u", 5, "/q/2"), "Post", "Post", "/q/1"), 1),
            rooted(with_route(event(3, "u", 9, "/q/2"), "Post", "Post", "/q/2"), 1),
        ];
        let outcome = annotate(&events);
        let refreshes: Vec<_> = outcome.patches.iter().map(|p| p.page_refresh).collect();

        assert_eq!(refreshes, vec![false, false, true]);
    }

    #[test]
    fn test_truncated_referrer_resolves_to_earlier_post() {
        let question = "/questions/35352638/react-router-how-to-get-parameter-value-from-url";
        let answer = "/questions/35352638/react-router-how-to-get-parameter-value-from-url/48256676";
        let events = vec![
            rooted(with_route(event(1, "u", 0, question), "Search", "Post", "/search"), 1),
            rooted(
                with_route(event(2, "u", 20, answer), "Post", "Post", "/questions/35352638/react-router-how-to"),
                1,
            ),
        ];
        let outcome = annotate(&events);

        assert_eq!(outcome.patches[0].normalized_url.as_deref(), Some("/q/35352638"));
        assert_eq!(outcome.patches[0].normalized_referrer, None);
        assert_eq!(outcome.patches[1].normalized_url.as_deref(), Some("/a/48256676"));
        // both recorded urls match the truncated referrer, the later one wins
        assert_eq!(outcome.patches[1].normalized_referrer.as_deref(), Some("/a/48256676"));
    }

    #[test]
    fn test_referrer_resolution_skips_non_matching_posts() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/questions/11/first"), "Search", "Post", "/search"), 1),
            rooted(with_route(event(2, "u", 10, "/questions/22/second"), "Post", "Post", "/questions/11/fi"), 1),
        ];
        let outcome = annotate(&events);

        assert_eq!(outcome.patches[1].normalized_referrer.as_deref(), Some("/q/11"));
    }

    #[test]
    fn test_non_post_targets_are_not_normalized() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/questions/tagged/rust?tab=new"), "Search", "Tag", ""), 1),
            rooted(with_route(event(2, "u", 3, "/q/7"), "Tag", "Post", "/questions/tagged"), 1),
        ];
        let outcome = annotate(&events);

        assert_eq!(outcome.patches[0].normalized_url, None);
        assert_eq!(outcome.patches[0].query.as_deref(), Some("tab=new"));
        assert_eq!(outcome.patches[1].normalized_url.as_deref(), Some("/q/7"));
        assert_eq!(outcome.patches[1].normalized_referrer, None);
        assert!(outcome.anomalies.is_empty());
    }

    #[test]
    fn test_unnormalizable_post_url_is_an_anomaly() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/users/5"), "Search", "Post", ""), 1),
            rooted(with_route(event(2, "u", 3, "/q/7"), "Post", "Post", "/users/5"), 1),
        ];
        let outcome = annotate(&events);

        assert_eq!(outcome.patches[0].normalized_url, None);
        assert_eq!(outcome.patches[1].normalized_url.as_deref(), Some("/q/7"));
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].event_id(), 1);
    }

    #[test]
    fn test_annotation_is_idempotent() {
        let events = vec![
            rooted(with_route(event(1, "u", 0, "/questions/5/x?a=1#f"), "Search", "Post", "/search"), 1),
            rooted(with_route(event(2, "u", 2, "/questions/5/x?a=1#f"), "Post", "Post", "/questions/5"), 1),
            rooted(with_route(event(3, "u", 9, "/questions/5/x/6"), "Post", "Post", "/questions/5/x"), 1),
        ];
        let first = annotate(&events);
        let annotated = apply(&events, &first);
        let second = annotate(&annotated);

        assert_eq!(first, second);
    }

    #[test]
    fn test_precondition_violations() {
        let normalizer = StackOverflowNormalizer;
        assert!(matches!(
            annotate_sequence(1, &[], &normalizer),
            Err(PreconditionError::EmptyGroup { .. })
        ));

        let events = vec![rooted(event(1, "u", 0, "/q/1"), 1), event(2, "u", 1, "/q/1")];
        assert!(matches!(
            annotate_sequence(1, &events, &normalizer),
            Err(PreconditionError::MixedRoots { event_id: 2, found: None, .. })
        ));
    }
}
