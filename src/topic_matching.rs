//! Topic names, topic filters and wildcard matching
//!
//! `+` matches exactly one level, `#` matches the remaining levels (including
//! the parent level) and must be the last token of a filter. Topics starting
//! with `$` are never matched by a filter whose first level is a wildcard.

use crate::error::{Result, SessionError};

const MAX_TOPIC_LEN: usize = 65535;

/// Matches a topic name against a topic filter
///
/// # Examples
/// ```
/// # use mqtt_session::topic_matching::matches;
/// assert!(matches("sport/tennis", "sport/tennis"));
/// assert!(matches("sport/tennis", "sport/+"));
/// assert!(matches("sport/tennis/player1", "sport/#"));
/// assert!(matches("sport", "sport/#"));
/// assert!(!matches("sport/tennis", "sport/+/player1"));
/// ```
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    if !is_valid_topic(topic) || !is_valid_filter(filter) {
        return false;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut levels = topic.split('/');
    for token in filter.split('/') {
        match token {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Whether `topic` is a publishable topic name (non-empty, wildcard free)
#[must_use]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.contains(['+', '#', '\0'])
}

/// Whether `filter` is a well-formed topic filter
#[must_use]
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return false;
    }
    let mut tokens = filter.split('/').peekable();
    while let Some(token) = tokens.next() {
        let is_last = tokens.peek().is_none();
        if token.contains('#') && (token != "#" || !is_last) {
            return false;
        }
        if token.contains('+') && token != "+" {
            return false;
        }
    }
    true
}

/// # Errors
///
/// Returns `SessionError::InvalidTopicName` if the topic cannot be published to
pub fn validate_topic(topic: &str) -> Result<()> {
    if is_valid_topic(topic) {
        return Ok(());
    }
    let why = if topic.is_empty() {
        "empty topic"
    } else if topic.contains(['+', '#']) {
        "wildcards not allowed in topic names"
    } else if topic.contains('\0') {
        "null character not allowed"
    } else {
        "topic too long"
    };
    Err(SessionError::InvalidTopicName(format!("{topic:?}: {why}")))
}

/// # Errors
///
/// Returns `SessionError::InvalidTopicFilter` if the filter is malformed
pub fn validate_filter(filter: &str) -> Result<()> {
    if is_valid_filter(filter) {
        return Ok(());
    }
    let why = if filter.is_empty() {
        "empty filter"
    } else if filter.contains('\0') {
        "null character not allowed"
    } else if filter.len() > MAX_TOPIC_LEN {
        "filter too long"
    } else {
        "invalid wildcard usage"
    };
    Err(SessionError::InvalidTopicFilter(format!("{filter:?}: {why}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_matching() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/c"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("a//c", "a/+/c"));
        assert!(!matches("a/b/d/c", "a/+/c"));
        assert!(!matches("a", "a/+"));
        assert!(matches("a/", "a/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a", "#"));
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a", "a/#"));
        assert!(matches("a/b/c/d", "a/+/#"));
        assert!(!matches("b/c", "a/#"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("$SYS/broker/load", "#"));
        assert!(!matches("$SYS/broker", "+/broker"));
        assert!(matches("$SYS/broker/load", "$SYS/#"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(is_valid_filter("a/+/b"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter("a/b#"));
        assert!(!is_valid_filter("a+/b"));
        assert!(validate_filter("a/#/b").is_err());
    }

    #[test]
    fn test_topic_validation() {
        assert!(is_valid_topic("a/b"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("a/+"));
        assert!(!is_valid_topic("a/#"));
        assert!(matches!(
            validate_topic("a/+"),
            Err(SessionError::InvalidTopicName(_))
        ));
    }

    #[test]
    fn test_invalid_inputs_never_match() {
        assert!(!matches("", "#"));
        assert!(!matches("a/b", "a/#/b"));
    }
}
