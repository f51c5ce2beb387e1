pub mod logging;

/// Truncates a value for log output so message bodies never flood the logs.
pub fn preview_text(value: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    let mut chars = value.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::preview_text;

    #[test]
    fn preview_text_passes_short_values_through() {
        assert_eq!(preview_text("hello"), "hello");
    }

    #[test]
    fn preview_text_truncates_long_values() {
        let long = "x".repeat(200);
        let preview = preview_text(&long);
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), 121);
    }
}
