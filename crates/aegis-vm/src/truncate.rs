//! Transcript truncation.
//!
//! Command output can be arbitrarily large; the tail is what usually carries
//! the result or the error, so truncation keeps the last `max_chars`
//! characters and states how much was elided.

/// Maximum characters of a transcript handed back to the agent.
pub const DEFAULT_MAX_CHARS: usize = 10_000;

/// Trim `text` and keep at most `max_chars` characters from the tail,
/// prefixed with the elision count. Splits on character boundaries.
pub fn limit_output(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let hidden = total - max_chars;
    let tail: String = text
        .chars()
        .skip(total - max_chars)
        .collect();
    format!("(output truncated, {hidden} characters hidden)\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_returned_trimmed() {
        assert_eq!(limit_output("  hello  \n", DEFAULT_MAX_CHARS), "hello");
    }

    #[test]
    fn exact_boundary_not_truncated() {
        let s: String = "x".repeat(DEFAULT_MAX_CHARS);
        let out = limit_output(&s, DEFAULT_MAX_CHARS);
        assert_eq!(out.len(), DEFAULT_MAX_CHARS);
        assert!(!out.contains("truncated"));
    }

    #[test]
    fn keeps_tail_and_reports_hidden_count() {
        let input = format!("{}{}", "a".repeat(500), "b".repeat(100));
        let out = limit_output(&input, 100);
        assert!(out.starts_with("(output truncated, 500 characters hidden)\n"));
        assert!(out.ends_with(&"b".repeat(100)));
        assert!(!out.contains('a'));
    }

    #[test]
    fn multibyte_tail_is_boundary_safe() {
        let input = format!("{}é", "é".repeat(20_000));
        // must not panic on char boundaries
        let out = limit_output(&input, DEFAULT_MAX_CHARS);
        assert!(out.contains("characters hidden"));
        assert!(out.ends_with('é'));
    }
}
