//! Outcome classification for one transcription attempt.
//!
//! All of the heuristics that decide "retry", "escalate" or "give up" live
//! here, so retry control flow in the orchestrator never pattern-matches on
//! model output itself.

use std::sync::LazyLock;

use regex::Regex;

use pagescribe_shared::{PagescribeError, Result};

/// Responses shorter than this are checked for refusal language.
pub const REFUSAL_MAX_CHARS: usize = 100;

static REFUSAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(i'?m sorry|i am sorry|i apologi[sz]e|sorry, (but )?i|i can(not|'t|’t)|i'?m (unable|not able)|i am (unable|not able)|unable to (help|assist|transcribe|comply|process)|i won'?t|as an ai|not able to (help|assist|transcribe))",
    )
    .expect("valid regex")
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(rate.?limit|too many requests|timed? ?out|timeout|temporarily unavailable|overloaded|connection (reset|refused|closed)|\b5\d\d\b)",
    )
    .expect("valid regex")
});

/// What to do with one attempt's result.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Usable text.
    Success(String),
    /// Nothing came back; retry.
    Empty,
    /// The model declined; retry, escalating after a few attempts.
    Refusal,
    /// Temporary failure; retry after backoff.
    Transient(String),
    /// Will not improve on retry; fail the page.
    Fatal(String),
}

/// Classify a (normalized) backend result.
pub fn classify(result: Result<String>) -> Outcome {
    match result {
        Ok(text) if text.trim().is_empty() => Outcome::Empty,
        Ok(text) if is_refusal(&text) => Outcome::Refusal,
        Ok(text) => Outcome::Success(text),
        Err(e) if e.is_retryable() => Outcome::Transient(e.to_string()),
        Err(e @ PagescribeError::Backend { .. }) => Outcome::Fatal(e.to_string()),
        Err(e) => {
            let message = e.to_string();
            if TRANSIENT_RE.is_match(&message) {
                Outcome::Transient(message)
            } else {
                Outcome::Fatal(message)
            }
        }
    }
}

/// Short response containing refusal language.
pub fn is_refusal(text: &str) -> bool {
    let text = text.trim();
    text.chars().count() < REFUSAL_MAX_CHARS && REFUSAL_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_empty() {
        assert_eq!(classify(Ok(String::new())), Outcome::Empty);
        assert_eq!(classify(Ok("  \n ".into())), Outcome::Empty);
    }

    #[test]
    fn short_apologies_are_refusals() {
        for text in [
            "I'm sorry, but I can't help with that.",
            "I cannot transcribe copyrighted material.",
            "Sorry, I am unable to assist with this request.",
            "I apologize, but I won't reproduce this text.",
        ] {
            assert_eq!(classify(Ok(text.into())), Outcome::Refusal, "{text}");
        }
    }

    #[test]
    fn long_text_with_apology_is_success() {
        let text = format!(
            "\"I'm sorry,\" she said, and meant it. {}",
            "The rain kept falling over the harbor. ".repeat(4)
        );
        assert!(matches!(classify(Ok(text)), Outcome::Success(_)));
    }

    #[test]
    fn ordinary_text_is_success() {
        assert_eq!(
            classify(Ok("Call me Ishmael.".into())),
            Outcome::Success("Call me Ishmael.".into())
        );
    }

    #[test]
    fn backend_errors_follow_retryable_flag() {
        assert!(matches!(
            classify(Err(PagescribeError::retryable("HTTP 429"))),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify(Err(PagescribeError::fatal_backend("HTTP 401 unauthorized"))),
            Outcome::Fatal(_)
        ));
    }

    #[test]
    fn other_errors_are_matched_by_message() {
        assert!(matches!(
            classify(Err(PagescribeError::Storage("connection reset by peer".into()))),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify(Err(PagescribeError::Storage("image missing".into()))),
            Outcome::Fatal(_)
        ));
    }
}
