//! Boilerplate-stripping text extraction for fetched pages.

use regex::Regex;
use std::sync::OnceLock;

/// Elements whose whole subtree is page chrome rather than content.
const BOILERPLATE_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "svg", "iframe",
    "template",
];

/// Tags that end a visual line.
const BLOCK_TAGS: &str = "p|div|br|li|tr|h1|h2|h3|h4|h5|h6|section|article|blockquote|pre|table|ul|ol|dd|dt";

fn boilerplate_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BOILERPLATE_TAGS
            .iter()
            .filter_map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).ok())
            .collect()
    })
}

fn comment_pattern() -> &'static Option<Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").ok())
}

fn block_break_pattern() -> &'static Option<Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(&format!(r"(?i)</?(?:{})\b[^>]*>", BLOCK_TAGS)).ok())
}

/// Extract readable text from a response body.
///
/// HTML is stripped of navigation, scripts and other chrome; anything else
/// is returned with whitespace normalized.
pub fn extract_text(body: &str, content_type: Option<&str>) -> String {
    let is_html = match content_type {
        Some(ct) => ct.contains("html"),
        None => looks_like_html(body),
    };
    if is_html {
        extract_text_from_html(body)
    } else {
        normalize_whitespace(body)
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(512).collect::<String>().to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype html") || head.contains("<body")
}

/// Extract readable text from HTML.
pub fn extract_text_from_html(html: &str) -> String {
    let mut text = html.to_string();

    if let Some(re) = comment_pattern() {
        text = re.replace_all(&text, " ").into_owned();
    }
    for re in boilerplate_patterns() {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = block_break_pattern() {
        text = re.replace_all(&text, "\n").into_owned();
    }

    // Remove remaining tags
    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        if c == '<' {
            in_tag = true;
        } else if c == '>' {
            in_tag = false;
            result.push(' ');
        } else if !in_tag {
            result.push(c);
        }
    }

    normalize_whitespace(&html_decode(&result))
}

/// Collapse runs of spaces within lines and drop blank lines.
fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Basic HTML entity decoding.
fn html_decode(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            let mut cut = text[..byte_idx].to_string();
            cut.push_str("\n\n[Truncated: full page was longer]");
            cut
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_boilerplate_and_tags() {
        let html = r#"<html><head><style>body{color:red}</style><script>var x = 1;</script></head>
<body><nav><a href="/">Home</a> | <a href="/about">About</a></nav>
<article><h1>Douglas Adams</h1><p>Born 11 March 1952 in Cambridge.</p></article>
<footer>Copyright &copy; site</footer></body></html>"#;
        let text = extract_text_from_html(html);
        assert!(text.contains("Douglas Adams"));
        assert!(text.contains("Born 11 March 1952 in Cambridge."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("About"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn test_decodes_entities() {
        let text = extract_text_from_html("<p>Tom &amp; Jerry &lt;3</p>");
        assert_eq!(text, "Tom & Jerry <3");
    }

    #[test]
    fn test_block_tags_become_lines() {
        let text = extract_text_from_html("<p>one</p><p>two</p>");
        assert_eq!(text, "one\ntwo");
    }

    #[test]
    fn test_plain_text_passthrough() {
        let text = extract_text("  a   b \n\n c ", Some("text/plain"));
        assert_eq!(text, "a b\nc");
    }

    #[test]
    fn test_sniffs_html_without_content_type() {
        let text = extract_text("<!DOCTYPE html><html><body><p>hi</p></body></html>", None);
        assert_eq!(text, "hi");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short".to_string(), 10), "short");
        let cut = truncate_chars("ééééé".to_string(), 2);
        assert!(cut.starts_with("éé\n\n[Truncated"));
    }
}
