use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::RoomPermissions;

use super::PolicyRejection;

// Scheme+host URLs plus the shorteners and invite links people actually
// paste into chat.
static URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)https?://\S+",
        r"(?i)\bwww\.\S+\.[a-z]{2,}\S*",
        r"(?i)\bdiscord\.gg/\S+",
        r"(?i)\b(?:bit\.ly|t\.co|youtu\.be)/\S+",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("url pattern"))
    .collect()
});

static CUSTOM_EMOJI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<a?:([A-Za-z0-9_]+):\d+>").expect("emoji pattern"));

static USER_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@[!&]?\d+>").expect("mention pattern"));

const DEFAULT_BLOCKED_WORDS: &[&str] = &[
    "spam",
    "scam",
    "fraud",
    "phishing",
    "malware",
    "get rich quick",
    "free money",
    "click here",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredMessage {
    pub text: String,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Accepted(FilteredMessage),
    Rejected(PolicyRejection),
}

/// Applies the per-room content rules in a fixed order; the first failing
/// rule wins.
pub struct ContentFilter {
    blocked_words: Vec<String>,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFilter {
    pub fn new() -> Self {
        Self {
            blocked_words: DEFAULT_BLOCKED_WORDS
                .iter()
                .map(|w| w.to_string())
                .collect(),
        }
    }

    pub fn contains_url(&self, text: &str) -> bool {
        URL_PATTERNS.iter().any(|pattern| pattern.is_match(text))
    }

    pub fn contains_blocked_word(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.blocked_words.iter().any(|word| lowered.contains(word))
    }

    pub fn apply(
        &self,
        text: &str,
        attachments: &[String],
        permissions: &RoomPermissions,
    ) -> FilterOutcome {
        let max_len = permissions.max_message_length.max(1) as usize;
        if text.chars().count() > max_len {
            return FilterOutcome::Rejected(PolicyRejection::TooLong { max_len });
        }

        if !permissions.allow_urls && self.contains_url(text) {
            return FilterOutcome::Rejected(PolicyRejection::UrlsDisallowed);
        }

        if !permissions.allow_files && !attachments.is_empty() {
            return FilterOutcome::Rejected(PolicyRejection::AttachmentsDisallowed);
        }

        let mut text = text.to_string();
        if !permissions.allow_mentions {
            text = strip_mentions(&text);
        }
        if !permissions.allow_emojis {
            text = strip_custom_emojis(&text);
        }

        if permissions.enable_bad_word_filter && self.contains_blocked_word(&text) {
            return FilterOutcome::Rejected(PolicyRejection::BannedWord);
        }

        FilterOutcome::Accepted(FilteredMessage {
            text: normalize(&text),
            attachments: attachments.to_vec(),
        })
    }
}

/// Defuses pings without erasing what the author wrote: broadcast mentions
/// get a zero-width space, user/role tokens become plain text.
fn strip_mentions(text: &str) -> String {
    let text = text
        .replace("@everyone", "@\u{200b}everyone")
        .replace("@here", "@\u{200b}here");
    USER_MENTION.replace_all(&text, "@member").into_owned()
}

fn strip_custom_emojis(text: &str) -> String {
    CUSTOM_EMOJI.replace_all(text, ":$1:").into_owned()
}

/// Trims control characters from the edges and collapses runs of blank
/// lines; user-visible markup is preserved.
fn normalize(text: &str) -> String {
    let trimmed = text.trim_matches(|c: char| c.is_control() || c.is_whitespace());
    let mut out = String::with_capacity(trimmed.len());
    let mut blank_run = 0usize;
    for line in trimmed.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn permissions() -> RoomPermissions {
        RoomPermissions {
            room_id: 1,
            allow_urls: false,
            allow_files: false,
            allow_mentions: true,
            allow_emojis: true,
            enable_bad_word_filter: true,
            max_message_length: 100,
            rate_limit_seconds: 0,
            updated_by: "admin".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn accepted_text(outcome: FilterOutcome) -> String {
        match outcome {
            FilterOutcome::Accepted(message) => message.text,
            FilterOutcome::Rejected(rejection) => panic!("unexpected rejection: {rejection:?}"),
        }
    }

    #[test]
    fn long_messages_are_rejected_first() {
        let filter = ContentFilter::new();
        let outcome = filter.apply(&"x".repeat(200), &[], &permissions());
        assert!(matches!(
            outcome,
            FilterOutcome::Rejected(PolicyRejection::TooLong { .. })
        ));
    }

    #[test]
    fn urls_are_rejected_when_disallowed() {
        let filter = ContentFilter::new();
        for text in [
            "check https://example.com",
            "see www.example.org/page",
            "join discord.gg/abc123",
            "short youtu.be/xyz",
        ] {
            assert!(matches!(
                filter.apply(text, &[], &permissions()),
                FilterOutcome::Rejected(PolicyRejection::UrlsDisallowed)
            ));
        }
    }

    #[test]
    fn urls_pass_when_allowed() {
        let filter = ContentFilter::new();
        let mut perms = permissions();
        perms.allow_urls = true;
        let text = accepted_text(filter.apply("see https://example.com", &[], &perms));
        assert!(text.contains("https://example.com"));
    }

    #[test]
    fn attachments_are_rejected_when_disallowed() {
        let filter = ContentFilter::new();
        let outcome = filter.apply("look", &["https://cdn/a.png".to_string()], &permissions());
        assert!(matches!(
            outcome,
            FilterOutcome::Rejected(PolicyRejection::AttachmentsDisallowed)
        ));
    }

    #[test]
    fn mentions_are_defused_when_disallowed() {
        let filter = ContentFilter::new();
        let mut perms = permissions();
        perms.allow_mentions = false;
        let text = accepted_text(filter.apply("hey @everyone and <@1234>", &[], &perms));
        assert!(!text.contains("@everyone"));
        assert!(text.contains("@\u{200b}everyone"));
        assert!(text.contains("@member"));
    }

    #[test]
    fn custom_emojis_are_reduced_to_names() {
        let filter = ContentFilter::new();
        let mut perms = permissions();
        perms.allow_emojis = false;
        let text = accepted_text(filter.apply("nice <:party:12345> and <a:spin:9>", &[], &perms));
        assert_eq!(text, "nice :party: and :spin:");
    }

    #[test]
    fn blocked_words_are_rejected() {
        let filter = ContentFilter::new();
        assert!(matches!(
            filter.apply("great PHISHING offer", &[], &permissions()),
            FilterOutcome::Rejected(PolicyRejection::BannedWord)
        ));
    }

    #[test]
    fn blocked_word_filter_can_be_disabled() {
        let filter = ContentFilter::new();
        let mut perms = permissions();
        perms.enable_bad_word_filter = false;
        accepted_text(filter.apply("spam spam spam", &[], &perms));
    }

    #[test]
    fn acceptance_normalizes_whitespace() {
        let filter = ContentFilter::new();
        let text = accepted_text(filter.apply("  hello \n\n\n\nworld  \u{0000}", &[], &permissions()));
        assert_eq!(text, "hello\n\nworld");
    }
}
