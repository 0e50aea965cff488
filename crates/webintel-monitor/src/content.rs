//! Content normalization, fingerprinting and change detection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of comparing two fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDiffResult {
    pub has_changed: bool,
    pub previous_hash: Option<String>,
    pub current_hash: String,
}

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Unicode whitespace plus the ASCII separator controls `\x1c`..=`\x1f`.
fn is_line_padding(c: char) -> bool {
    c.is_whitespace() || matches!(c, '\x1c'..='\x1f')
}

/// Trim every line and drop the ones left empty.
///
/// The result joins the surviving lines with `\n`, so trailing whitespace and
/// blank-line churn never change it. Applying it twice is the same as once.
pub fn normalize_content(content: &str) -> String {
    content
        .split(is_line_break)
        .map(|line| line.trim_matches(is_line_padding))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lowercase hex SHA-256 of the normalized content.
pub fn compute_content_hash(content: &str) -> String {
    let normalized = normalize_content(content);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Compare the previous fingerprint (if any) with the current one.
///
/// A first observation is never reported as a change.
pub fn diff_hashes(previous_hash: Option<&str>, current_hash: &str) -> MonitorDiffResult {
    MonitorDiffResult {
        has_changed: previous_hash.is_some_and(|previous| previous != current_hash),
        previous_hash: previous_hash.map(str::to_string),
        current_hash: current_hash.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_strips_and_drops_blank_lines() {
        let raw = "  alpha  \n\n\t beta\t\r\n   \n gamma";
        assert_eq!(normalize_content(raw), "alpha\nbeta\ngamma");
    }

    #[test]
    fn test_normalize_empty_and_whitespace_only() {
        assert_eq!(normalize_content(""), "");
        assert_eq!(normalize_content(" \n\t\r\n  "), "");
    }

    #[test]
    fn test_normalize_splits_on_bare_carriage_return() {
        assert_eq!(normalize_content("one\rtwo\u{2028}three"), "one\ntwo\nthree");
    }

    #[test]
    fn test_normalize_trims_separator_controls() {
        assert_eq!(normalize_content("a\x1f"), "a");
        assert_eq!(normalize_content("\x1f\x1f\n  b\x1f \n\x1f"), "b");
        assert_eq!(compute_content_hash("a\x1f"), compute_content_hash("a"));
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(
            compute_content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            compute_content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_is_lowercase_hex() {
        let hash = compute_content_hash("<html>Some Page</html>");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_hash_ignores_whitespace_churn() {
        let a = compute_content_hash("title\nbody");
        let b = compute_content_hash("\n  title   \n\n\nbody  \n\n");
        assert_eq!(a, b);
        assert_ne!(a, compute_content_hash("title\nbody changed"));
    }

    #[test]
    fn test_diff_first_observation_is_unchanged() {
        let diff = diff_hashes(None, "abc");
        assert!(!diff.has_changed);
        assert_eq!(diff.previous_hash, None);
        assert_eq!(diff.current_hash, "abc");
    }

    #[test]
    fn test_diff_sequence() {
        let a = compute_content_hash("A");
        let b = compute_content_hash("B");

        let first = diff_hashes(None, &a);
        let second = diff_hashes(Some(&a), &a);
        let third = diff_hashes(Some(&a), &b);

        assert_eq!(
            [first.has_changed, second.has_changed, third.has_changed],
            [false, false, true]
        );
        assert_eq!(third.previous_hash.as_deref(), Some(a.as_str()));
    }

    // Strategy for lines without surrounding whitespace or embedded breaks
    fn content_line() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9<>/=\"][a-zA-Z0-9 <>/=\"]{0,30}[a-zA-Z0-9<>/=\"]"
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(text in "\\PC*") {
            let once = normalize_content(&text);
            prop_assert_eq!(normalize_content(&once), once);
        }

        #[test]
        fn normalize_is_idempotent_with_mixed_breaks(text in "[ a-z\t\r\n\u{0b}\u{0c}]{0,80}") {
            let once = normalize_content(&text);
            prop_assert_eq!(normalize_content(&once), once);
        }

        // Padding lines with whitespace and inserting blank lines keeps the hash
        #[test]
        fn hash_insensitive_to_padding(
            lines in proptest::collection::vec(content_line(), 0..10),
            padding in proptest::collection::vec((0usize..4, 0usize..3), 10),
        ) {
            let plain = lines.join("\n");
            let padded: String = lines
                .iter()
                .zip(padding.iter())
                .map(|(line, (spaces, blanks))| {
                    format!("{}{}{}\n{}", " ".repeat(*spaces), line, "\t".repeat(*spaces), "\n".repeat(*blanks))
                })
                .collect();

            prop_assert_eq!(compute_content_hash(&plain), compute_content_hash(&padded));
        }
    }
}
