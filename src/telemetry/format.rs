//! Helpers that keep log fields short and readable.

use std::time::Duration;

const DEFAULT_CODE_PREVIEW: usize = 50;

/// Render a duration as `µs`, `ms` or `s` with two decimals.
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        format!("{:.2}µs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{ms:.2}ms")
    } else {
        format!("{:.2}s", ms / 1000.0)
    }
}

/// Collapse source text onto one line and cap it at `max_len` characters.
pub fn truncate_code(code: &str, max_len: Option<usize>) -> String {
    let max_len = max_len.unwrap_or(DEFAULT_CODE_PREVIEW).max(4);
    let one_line = code.replace('\n', " ");
    let one_line = one_line.trim();
    if one_line.chars().count() <= max_len {
        return one_line.to_string();
    }
    let mut out: String = one_line.chars().take(max_len - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_units() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250.00µs");
        assert_eq!(format_duration(Duration::from_millis(12)), "12.00ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_short_code_kept() {
        assert_eq!(truncate_code("  1 + 1\n", None), "1 + 1");
    }

    #[test]
    fn test_long_code_truncated() {
        let code = "x".repeat(80);
        let out = truncate_code(&code, Some(10));
        assert_eq!(out, "xxxxxxx...");
    }

    #[test]
    fn test_multibyte_is_char_safe() {
        let out = truncate_code("ééééééééééé", Some(6));
        assert_eq!(out, "ééé...");
    }
}
