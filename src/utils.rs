//! Shared utility helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Generate an 8-hex background-job id.
///
/// Job ids are deliberately short: they appear in `.tool-output/<id>.txt`
/// paths and in `bash_kill` arguments the model has to echo back verbatim.
/// The leading 8 hex digits of a fresh UUID give 32 bits of entropy, plenty
/// for the handful of jobs alive in one process.
pub fn job_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

/// Generate a synthetic tool-call id for providers that omit one.
pub fn call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Current Unix-epoch timestamp in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shorten a string for history previews and argument summaries.
///
/// Keeps at most `max` characters (not bytes, so multi-byte content never
/// splits) and marks elision with a trailing `…`.
pub fn preview(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if out.len() < s.len() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_8_hex() {
        let id = job_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(job_id(), job_id());
    }

    #[test]
    fn call_id_is_prefixed_and_unique() {
        let id = call_id();
        assert!(id.starts_with("call_"));
        assert_ne!(call_id(), call_id());
    }

    #[test]
    fn preview_passes_short_strings_through() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("hello", 5), "hello");
    }

    #[test]
    fn preview_elides_long_strings() {
        assert_eq!(preview("hello world", 5), "hello…");
    }

    #[test]
    fn preview_counts_chars_not_bytes() {
        // Four chars of three bytes each; a byte cut at 6 would split none,
        // but a char cut keeps exactly two.
        assert_eq!(preview("éééé", 2), "éé…");
        assert_eq!(preview("éééé", 4), "éééé");
    }
}
