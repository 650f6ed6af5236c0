//! Topic pattern matching.
//!
//! Topics are dot-segmented (`guardian.shinkami.task`). Patterns use the same
//! shape with two wildcard segments:
//! - `*` matches exactly one segment
//! - `**` matches every remaining segment, including none

/// Separator between topic segments.
pub const SEGMENT_SEPARATOR: char = '.';

const SINGLE_WILDCARD: &str = "*";
const GLOBSTAR: &str = "**";

/// Check whether `pattern` matches `topic`.
///
/// ```
/// use conductor_bus::topic_matches;
///
/// assert!(topic_matches("guardian.*", "guardian.shinkami"));
/// assert!(!topic_matches("guardian.*", "guardian.shinkami.task"));
/// assert!(topic_matches("guardian.**", "guardian.shinkami.task"));
/// ```
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let mut pattern_parts = pattern.split(SEGMENT_SEPARATOR);
    let mut topic_parts = topic.split(SEGMENT_SEPARATOR);

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some(GLOBSTAR), _) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether a pattern contains wildcard segments.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(SEGMENT_SEPARATOR)
        .any(|segment| segment == SINGLE_WILDCARD || segment == GLOBSTAR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("guardian.shinkami", "guardian.shinkami"));
        assert!(!topic_matches("guardian.shinkami", "guardian.lyria"));
        assert!(!topic_matches("guardian", "guardian.shinkami"));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(topic_matches("guardian.*", "guardian.shinkami"));
        assert!(!topic_matches("guardian.*", "guardian.shinkami.task"));
        assert!(!topic_matches("guardian.*", "guardian"));
        assert!(topic_matches("*.task", "shinkami.task"));
        assert!(topic_matches("guardian.*.task", "guardian.shinkami.task"));
        assert!(!topic_matches("guardian.*.task", "guardian.shinkami.result"));
    }

    #[test]
    fn test_globstar() {
        assert!(topic_matches("guardian.**", "guardian.shinkami"));
        assert!(topic_matches("guardian.**", "guardian.shinkami.task"));
        assert!(topic_matches("guardian.**", "guardian"));
        assert!(topic_matches("**", "anything.at.all"));
        assert!(!topic_matches("guardian.**", "council.vote"));
    }

    #[test]
    fn test_globstar_terminates_comparison() {
        // Segments after `**` are never inspected.
        assert!(topic_matches("a.**.z", "a.b.c.d"));
    }

    #[test]
    fn test_exact_string_match_wins() {
        // A literal `*` topic is matched by the identical pattern.
        assert!(topic_matches("guardian.*", "guardian.*"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("guardian.*"));
        assert!(is_wildcard("**"));
        assert!(!is_wildcard("guardian.shinkami"));
        assert!(!is_wildcard("guardian.*x"));
    }
}
