//! Character-bounded truncation for persisted command output.

/// Text cut to at most `max_chars` characters, with the dropped count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub text: String,
    /// Characters removed; non-zero means the input exceeded the limit.
    pub dropped_chars: usize,
}

impl Truncated {
    pub fn was_truncated(&self) -> bool {
        self.dropped_chars > 0
    }
}

/// Keep the first `max_chars` characters of `text`.
///
/// Counts Unicode scalar values, not bytes, so the kept text never splits a
/// character.
pub fn truncate_chars(text: &str, max_chars: usize) -> Truncated {
    match text.char_indices().nth(max_chars) {
        None => Truncated {
            text: text.to_string(),
            dropped_chars: 0,
        },
        Some((cut, _)) => Truncated {
            text: text[..cut].to_string(),
            dropped_chars: text[cut..].chars().count(),
        },
    }
}

/// Truncate and append a visible notice (for text handed to humans or models).
pub fn truncate_with_notice(text: &str, max_chars: usize) -> String {
    let truncated = truncate_chars(text, max_chars);
    if truncated.was_truncated() {
        format!(
            "{}\n... [truncated {} chars]",
            truncated.text, truncated.dropped_chars
        )
    } else {
        truncated.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        let t = truncate_chars("abc", 10);
        assert_eq!(t.text, "abc");
        assert!(!t.was_truncated());
    }

    #[test]
    fn long_text_keeps_exactly_limit_chars() {
        let t = truncate_chars("abcdefgh", 5);
        assert_eq!(t.text, "abcde");
        assert_eq!(t.dropped_chars, 3);
    }

    #[test]
    fn multibyte_characters_are_counted_once() {
        let t = truncate_chars("héllo wörld", 4);
        assert_eq!(t.text, "héll");
        assert_eq!(t.text.chars().count(), 4);
        assert_eq!(t.dropped_chars, 7);
    }

    #[test]
    fn zero_limit_drops_everything() {
        let t = truncate_chars("abc", 0);
        assert_eq!(t.text, "");
        assert_eq!(t.dropped_chars, 3);
    }

    #[test]
    fn notice_is_appended_only_when_truncated() {
        assert_eq!(truncate_with_notice("abc", 3), "abc");
        assert_eq!(
            truncate_with_notice("abcdef", 3),
            "abc\n... [truncated 3 chars]"
        );
    }
}
