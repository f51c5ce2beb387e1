//! Envelope rendering and parsing.
//!
//! Every relayed message is wrapped in a fixed-grammar envelope so the bot's
//! own prior messages can be decoded back into author and content when
//! someone replies to them:
//!
//! ```text
//! ↩ **{reply_author}**: {quote}          (optional reply header)
//! 🌐 **{author}**: {body}
//! 📎 {attachment-url}                    (zero or more)
//! — {guild_name} • {permalink}
//! ```
//!
//! The `🌐 ` prefix doubles as the envelope marker. Changing any marker is a
//! wire-format break for envelopes already sitting in channel history, so
//! additions must keep the existing prefixes parseable.

/// Marks the author header and identifies bot envelopes.
pub const ENVELOPE_MARKER: &str = "🌐 ";
const REPLY_MARKER: &str = "↩ ";
const ATTACHMENT_MARKER: &str = "📎 ";
const BADGE_MARKER: &str = "— ";
const AUTHOR_OPEN: &str = "**";
const AUTHOR_CLOSE: &str = "**: ";

/// Platform hard cap on message length, in visible characters.
pub const MAX_ENVELOPE_CHARS: usize = 2000;
/// Cap for quoted reply text.
pub const MAX_QUOTE_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub author_display: String,
    pub quote: String,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub author_display: String,
    pub body: String,
    pub reply: Option<ReplyHeader>,
    pub attachments: Vec<String>,
    pub guild_name: String,
    pub permalink: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvelope {
    pub author_display: String,
    pub body: String,
    pub reply: Option<ReplyHeader>,
}

/// Display names lose characters that would collide with the grammar.
pub fn sanitize_display(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '*' && *c != '\n' && *c != '\r')
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "member".to_string()
    } else {
        cleaned
    }
}

pub fn permalink(guild_id: &str, channel_id: &str, message_id: &str) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}/{message_id}")
}

/// Truncates to the quote cap on a character boundary, appending an ellipsis.
pub fn truncate_quote(text: &str) -> String {
    truncate_chars(text.trim(), MAX_QUOTE_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// Renders the envelope. Overflow is resolved by truncating the body; the
/// headers and badge always survive.
pub fn render(envelope: &Envelope) -> String {
    let author = sanitize_display(&envelope.author_display);
    let mut header = String::new();
    if let Some(reply) = &envelope.reply {
        header.push_str(REPLY_MARKER);
        header.push_str(AUTHOR_OPEN);
        header.push_str(&sanitize_display(&reply.author_display));
        header.push_str(AUTHOR_CLOSE);
        header.push_str(&single_line(&truncate_quote(&reply.quote)));
        header.push('\n');
    }
    header.push_str(ENVELOPE_MARKER);
    header.push_str(AUTHOR_OPEN);
    header.push_str(&author);
    header.push_str(AUTHOR_CLOSE);

    let mut footer = String::new();
    for url in &envelope.attachments {
        footer.push('\n');
        footer.push_str(ATTACHMENT_MARKER);
        footer.push_str(url);
    }
    footer.push('\n');
    footer.push_str(BADGE_MARKER);
    footer.push_str(&single_line(&envelope.guild_name));
    footer.push_str(" • ");
    footer.push_str(&envelope.permalink);

    let overhead = header.chars().count() + footer.chars().count();
    let budget = MAX_ENVELOPE_CHARS.saturating_sub(overhead);
    let body = truncate_chars(&envelope.body, budget);

    format!("{header}{body}{footer}")
}

/// True when the text looks like one of our envelopes.
pub fn is_envelope(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.starts_with(ENVELOPE_MARKER))
}

fn parse_author_line<'a>(line: &'a str, marker: &str) -> Option<(String, &'a str)> {
    let rest = line.strip_prefix(marker)?.strip_prefix(AUTHOR_OPEN)?;
    let close = rest.find(AUTHOR_CLOSE)?;
    let author = rest[..close].to_string();
    let remainder = &rest[close + AUTHOR_CLOSE.len()..];
    Some((author, remainder))
}

/// Decodes an envelope back into author, body and reply header.
///
/// For every envelope produced by [`render`], the author and reply fields
/// round-trip exactly; the body round-trips unless it was truncated or
/// contains lines that collide with the attachment/badge markers.
pub fn parse(content: &str) -> Option<ParsedEnvelope> {
    let mut lines = content.lines().peekable();

    let mut reply = None;
    if let Some(line) = lines.peek() {
        if let Some((author_display, quote)) = parse_author_line(line, REPLY_MARKER) {
            reply = Some(ReplyHeader {
                author_display,
                quote: quote.to_string(),
            });
            lines.next();
        }
    }

    let author_line = lines.next()?;
    let (author_display, first_body) = parse_author_line(author_line, ENVELOPE_MARKER)?;

    let mut body_lines = vec![first_body.to_string()];
    for line in lines {
        if line.starts_with(ATTACHMENT_MARKER) || line.starts_with(BADGE_MARKER) {
            break;
        }
        body_lines.push(line.to_string());
    }

    Some(ParsedEnvelope {
        author_display,
        body: body_lines.join("\n"),
        reply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &str, reply: Option<ReplyHeader>) -> Envelope {
        Envelope {
            author_display: "alice".to_string(),
            body: body.to_string(),
            reply,
            attachments: Vec::new(),
            guild_name: "Guild A".to_string(),
            permalink: permalink("1", "2", "3"),
        }
    }

    #[test]
    fn plain_envelope_roundtrips() {
        let rendered = render(&envelope("hello there", None));
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.author_display, "alice");
        assert_eq!(parsed.body, "hello there");
        assert!(parsed.reply.is_none());
    }

    #[test]
    fn reply_envelope_roundtrips() {
        let reply = ReplyHeader {
            author_display: "bob".to_string(),
            quote: "original words".to_string(),
        };
        let rendered = render(&envelope("an answer", Some(reply.clone())));
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.author_display, "alice");
        assert_eq!(parsed.body, "an answer");
        assert_eq!(parsed.reply, Some(reply));
    }

    #[test]
    fn multiline_body_roundtrips() {
        let rendered = render(&envelope("line one\nline two", None));
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.body, "line one\nline two");
    }

    #[test]
    fn author_names_are_sanitized_for_the_grammar() {
        let mut env = envelope("hi", None);
        env.author_display = "e**vil\nname".to_string();
        let parsed = parse(&render(&env)).expect("parse");
        assert_eq!(parsed.author_display, "evilname");
    }

    #[test]
    fn overflow_truncates_body_not_headers() {
        let long_body = "x".repeat(5000);
        let rendered = render(&envelope(&long_body, None));
        assert!(rendered.chars().count() <= MAX_ENVELOPE_CHARS);
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.author_display, "alice");
        assert!(parsed.body.ends_with('…'));
        assert!(rendered.contains("Guild A"));
    }

    #[test]
    fn quotes_are_capped() {
        let quote = truncate_quote(&"q".repeat(500));
        assert_eq!(quote.chars().count(), MAX_QUOTE_CHARS);
        assert!(quote.ends_with('…'));
    }

    #[test]
    fn attachments_render_after_body() {
        let mut env = envelope("see this", None);
        env.attachments = vec!["https://cdn.example/a.png".to_string()];
        let rendered = render(&env);
        assert!(rendered.contains("📎 https://cdn.example/a.png"));
        let parsed = parse(&rendered).expect("parse");
        assert_eq!(parsed.body, "see this");
    }

    #[test]
    fn non_envelope_text_does_not_parse() {
        assert!(parse("just a normal message").is_none());
        assert!(!is_envelope("just a normal message"));
    }
}
