//! Formatting utilities (Telegram HTML escaping, human-readable sizes and
//! durations, caption templating).

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `1536` -> `"1.5 KiB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// `3725` -> `"1h 2m 5s"`.
pub fn readable_duration(total_seconds: u64) -> String {
    if total_seconds == 0 {
        return "0s".to_string();
    }

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m "));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}s"));
    }
    out.trim_end().to_string()
}

/// Apply the optional caption template (`{filename}` placeholder) to a
/// delivered file.
pub fn delivery_caption(template: Option<&str>, filename: &str) -> Option<String> {
    let template = template?;
    Some(template.replace("{filename}", &escape_html(filename)))
}

/// Trim a label to fit inline-keyboard button limits.
pub fn truncate_label(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_telegram_html() {
        assert_eq!(escape_html("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn formats_durations() {
        assert_eq!(readable_duration(0), "0s");
        assert_eq!(readable_duration(59), "59s");
        assert_eq!(readable_duration(3725), "1h 2m 5s");
        assert_eq!(readable_duration(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn caption_template_substitutes_filename() {
        assert_eq!(
            delivery_caption(Some("File: {filename}"), "a<b>.mkv"),
            Some("File: a&lt;b&gt;.mkv".to_string())
        );
        assert_eq!(delivery_caption(None, "a.mkv"), None);
    }

    #[test]
    fn truncates_long_labels() {
        assert_eq!(truncate_label("short", 10), "short");
        assert_eq!(truncate_label("a-very-long-name", 8), "a-very-…");
    }
}
