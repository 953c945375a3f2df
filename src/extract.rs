//! Content extraction: fetched HTML or Markdown → title, plain text,
//! headings, and outgoing links.
//!
//! The HTML path parses to a DOM, picks `<title>` (or the first `<h1>`)
//! as the title, reduces to the main content region, and emits plain text
//! with newlines at block-element boundaries while recording `<h1>`–`<h6>`
//! positions. The Markdown path strips HTML comments and leading YAML
//! frontmatter, then finds links and ATX headings by regex.
//!
//! Links are restricted to the page's host, fragments are stripped, and
//! order-preserving dedup is applied. Output text is whitespace
//! normalised: no triple newlines, no tabs, trimmed lines.

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crate::fetch::ContentKind;
use crate::models::{ExtractedPage, Heading};

/// Selectors tried in order for the main content region before falling
/// back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=\"main\"]",
    "#content",
    "#main-content",
    ".content",
    ".markdown-body",
    ".docs-content",
];

pub fn extract(url: &str, content: &str, kind: ContentKind) -> Result<ExtractedPage> {
    let base = Url::parse(url).with_context(|| format!("invalid page URL: {}", url))?;
    match kind {
        ContentKind::Html => Ok(extract_html(&base, content)),
        ContentKind::Markdown => Ok(extract_markdown(&base, content)),
    }
}

// ============ HTML ============

fn extract_html(base: &Url, html: &str) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let title = select_text(&doc, "title").or_else(|| select_text(&doc, "h1"));
    let links = html_links(&doc, base);

    let root = main_content(&doc);
    let mut raw = String::new();
    let mut headings = Vec::new();
    match root {
        Some(el) => emit_text(*el, &mut raw, &mut headings),
        None => {
            for child in doc.tree.root().children() {
                emit_text(child, &mut raw, &mut headings);
            }
        }
    }

    ExtractedPage {
        url: base.to_string(),
        title,
        content: normalize_whitespace(&raw),
        links,
        headings,
    }
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text: String = doc.select(&sel).next()?.text().collect::<Vec<_>>().join(" ");
    let text = collapse_spaces(&text);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn main_content<'a>(doc: &'a Html) -> Option<ElementRef<'a>> {
    for selector in CONTENT_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            if !el.text().all(|t| t.trim().is_empty()) {
                return Some(el);
            }
        }
    }
    let body = Selector::parse("body").expect("static selector");
    doc.select(&body).next()
}

fn html_links(doc: &Html, base: &Url) -> Vec<String> {
    let sel = Selector::parse("a[href]").expect("static selector");
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for anchor in doc.select(&sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if let Some(link) = admit_link(base, href) {
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }
    links
}

/// Resolve a candidate href against the page URL, keep it only when it
/// stays on the same host, and strip any fragment.
fn admit_link(base: &Url, href: &str) -> Option<String> {
    let mut resolved = base.join(href.trim()).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    if resolved.host_str() != base.host_str() {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "section"
            | "article"
            | "main"
            | "header"
            | "footer"
            | "aside"
            | "nav"
            | "ul"
            | "ol"
            | "li"
            | "table"
            | "tr"
            | "th"
            | "td"
            | "blockquote"
            | "pre"
            | "figure"
            | "figcaption"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "dl"
            | "dt"
            | "dd"
            | "hr"
    )
}

/// Recursive DOM walk: collapse text-node whitespace, newline at block
/// boundaries, and record heading positions as a running offset into the
/// emitted text. Offsets are approximate and diagnostic only.
fn emit_text(node: ego_tree::NodeRef<'_, Node>, out: &mut String, headings: &mut Vec<Heading>) {
    match node.value() {
        Node::Text(text) => {
            push_collapsed(out, text);
        }
        Node::Element(el) => {
            let name = el.name();
            if matches!(name, "script" | "style" | "noscript" | "template" | "svg" | "head") {
                return;
            }
            let level = heading_level(name);
            let start = out.len();

            for child in node.children() {
                emit_text(child, out, headings);
            }

            if let Some(level) = level {
                let text = out[start..].trim().to_string();
                if !text.is_empty() {
                    headings.push(Heading {
                        level,
                        text,
                        offset: start,
                    });
                }
            }
            if name == "br" || (is_block(name) && !out.is_empty() && !out.ends_with('\n')) {
                out.push('\n');
            }
        }
        _ => {
            for child in node.children() {
                emit_text(child, out, headings);
            }
        }
    }
}

fn push_collapsed(out: &mut String, text: &str) {
    for c in text.chars() {
        if c.is_whitespace() {
            if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
}

// ============ Markdown ============

fn extract_markdown(base: &Url, text: &str) -> ExtractedPage {
    let stripped = strip_comments(text);
    let stripped = strip_frontmatter(&stripped);
    let content = normalize_whitespace(&stripped);

    let link_re = regex::Regex::new(r"\[[^\]]*\]\(([^)\s]+)\)").expect("static regex");
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for capture in link_re.captures_iter(&content) {
        let href = &capture[1];
        if href.starts_with('#') {
            continue;
        }
        if let Some(link) = admit_link(base, href) {
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }

    let heading_re = regex::Regex::new(r"^(#{1,6})\s+(.+)$").expect("static regex");
    let mut headings = Vec::new();
    let mut offset = 0usize;
    let mut title = None;
    for line in content.split('\n') {
        if let Some(capture) = heading_re.captures(line) {
            let level = capture[1].len() as u8;
            let text = capture[2].trim().to_string();
            if title.is_none() && level == 1 {
                title = Some(text.clone());
            }
            headings.push(Heading {
                level,
                text,
                offset,
            });
        }
        offset += line.len() + 1;
    }

    ExtractedPage {
        url: base.to_string(),
        title,
        content,
        links,
        headings,
    }
}

fn strip_comments(text: &str) -> String {
    let re = regex::Regex::new(r"(?s)<!--.*?-->").expect("static regex");
    re.replace_all(text, "").into_owned()
}

/// Remove a leading `--- … ---` YAML frontmatter block.
fn strip_frontmatter(text: &str) -> String {
    let rest = if let Some(rest) = text.strip_prefix("---\r\n") {
        rest
    } else if let Some(rest) = text.strip_prefix("---\n") {
        rest
    } else {
        return text.to_string();
    };

    if let Some(pos) = rest.find("\n---") {
        let after = &rest[pos + 4..];
        let after = after.strip_prefix('\r').unwrap_or(after);
        let after = after.strip_prefix('\n').unwrap_or(after);
        return after.to_string();
    }
    text.to_string()
}

// ============ Whitespace ============

/// Trim every line, drop tabs, and collapse runs of blank lines so the
/// output never contains triple newlines.
pub fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut pending_blank = false;

    for raw in text.lines() {
        let line = raw.replace('\t', " ");
        let line = line.trim();
        if line.is_empty() {
            if !result.is_empty() {
                pending_blank = true;
            }
            continue;
        }
        if pending_blank {
            result.push_str("\n\n");
            pending_blank = false;
        } else if !result.is_empty() {
            result.push('\n');
        }
        result.push_str(line);
    }

    result
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://docs.example.com/start").unwrap()
    }

    #[test]
    fn test_html_title_from_title_tag() {
        let page = extract_html(&base(), "<html><head><title>Start</title></head><body><p>hi</p></body></html>");
        assert_eq!(page.title.as_deref(), Some("Start"));
    }

    #[test]
    fn test_html_title_falls_back_to_h1() {
        let page = extract_html(&base(), "<html><body><h1>Guide</h1><p>hi</p></body></html>");
        assert_eq!(page.title.as_deref(), Some("Guide"));
    }

    #[test]
    fn test_html_links_same_host_only() {
        let html = r##"<html><body>
            <a href="/a">A</a>
            <a href="/b#section">B</a>
            <a href="https://other.example.com/c">C</a>
            <a href="mailto:x@example.com">mail</a>
            <a href="/a">A again</a>
        </body></html>"##;
        let page = extract_html(&base(), html);
        assert_eq!(
            page.links,
            vec![
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_html_text_block_boundaries() {
        let html = "<html><body><h1>Title</h1><p>First para.</p><p>Second para.</p></body></html>";
        let page = extract_html(&base(), html);
        assert!(page.content.contains("Title"));
        assert!(page.content.contains("First para.\nSecond para."));
    }

    #[test]
    fn test_html_headings_in_order_with_offsets() {
        let html = "<html><body><h1>One</h1><p>alpha</p><h2>Two</h2><p>beta</p></body></html>";
        let page = extract_html(&base(), html);
        assert_eq!(page.headings.len(), 2);
        assert_eq!(page.headings[0].text, "One");
        assert_eq!(page.headings[0].level, 1);
        assert_eq!(page.headings[1].text, "Two");
        assert_eq!(page.headings[1].level, 2);
        assert!(page.headings[0].offset <= page.headings[1].offset);
    }

    #[test]
    fn test_html_main_content_preferred_over_nav() {
        let html = r#"<html><body>
            <nav><a href="/x">menu item</a></nav>
            <main><p>real content lives here</p></main>
        </body></html>"#;
        let page = extract_html(&base(), html);
        assert!(page.content.contains("real content lives here"));
        assert!(!page.content.contains("menu item"));
    }

    #[test]
    fn test_html_script_and_style_dropped() {
        let html = "<html><body><script>var x = 1;</script><style>.a{}</style><p>kept</p></body></html>";
        let page = extract_html(&base(), html);
        assert!(page.content.contains("kept"));
        assert!(!page.content.contains("var x"));
    }

    #[test]
    fn test_markdown_frontmatter_and_comments_stripped() {
        let md = "---\ntitle: Hidden\n---\n\n# Guide\n\n<!-- secret -->\nVisible text.";
        let page = extract_markdown(&base(), md);
        assert!(!page.content.contains("Hidden"));
        assert!(!page.content.contains("secret"));
        assert!(page.content.contains("Visible text."));
        assert_eq!(page.title.as_deref(), Some("Guide"));
    }

    #[test]
    fn test_markdown_headings() {
        let md = "# One\n\ntext\n\n## Two\n\nmore\n\n###### Six\n";
        let page = extract_markdown(&base(), md);
        let levels: Vec<u8> = page.headings.iter().map(|h| h.level).collect();
        assert_eq!(levels, vec![1, 2, 6]);
        assert_eq!(page.headings[1].text, "Two");
        // Offsets point into the content at each heading line.
        for h in &page.headings {
            assert!(page.content[h.offset..].starts_with(&"#".repeat(h.level as usize)));
        }
    }

    #[test]
    fn test_markdown_links_filtered() {
        let md = "[A](/a) [frag](#x) [ext](https://other.example.com/y) [B](/b)";
        let page = extract_markdown(&base(), md);
        assert_eq!(
            page.links,
            vec![
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_normalize_whitespace() {
        let text = "  a line  \n\n\n\nanother\tline\n";
        assert_eq!(normalize_whitespace(text), "a line\n\nanother line");
    }
}
