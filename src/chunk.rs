//! Size-and-heading-aware text chunker.
//!
//! Splits a page's plain text into chunks that respect `max_chunk_size`,
//! preferring heading boundaries, then paragraph boundaries, then
//! sentences, then words. Consecutive chunks within a section share
//! `overlap` trailing characters so context survives the cut. Emitted
//! chunks are dense: the caller indexes them `0..N-1` in order.
//!
//! Offsets are approximate — section start plus the running length of
//! previously emitted pieces — and are used only for diagnostics.

use regex::Regex;

use crate::models::Heading;

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            min_chunk_size: 100,
            overlap: 100,
        }
    }
}

/// A chunk before persistence: text, owning heading, and diagnostic
/// offsets into the page's plain text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub content: String,
    pub heading: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
}

struct Section {
    heading: Option<String>,
    text: String,
    start: usize,
}

pub fn split_chunks(content: &str, headings: &[Heading], opts: &ChunkOptions) -> Vec<ChunkPiece> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.len() <= opts.max_chunk_size {
        return vec![ChunkPiece {
            content: trimmed.to_string(),
            heading: headings.first().map(|h| h.text.clone()),
            start_offset: 0,
            end_offset: trimmed.len(),
        }];
    }

    let mut pieces = Vec::new();
    for section in partition_sections(content, headings) {
        split_section(&section, opts, &mut pieces);
    }

    merge_trailing_small(&mut pieces, opts);
    pieces
}

/// Locate each heading's literal text in the plain text (scanning
/// forward so repeated headings resolve in order) and cut the text at
/// those positions. Text before the first break belongs to a headingless
/// section.
fn partition_sections(content: &str, headings: &[Heading]) -> Vec<Section> {
    let mut breaks: Vec<(usize, String)> = Vec::new();
    let mut search_from = 0usize;
    for heading in headings {
        if heading.text.is_empty() {
            continue;
        }
        if let Some(pos) = content[search_from..].find(&heading.text) {
            let absolute = search_from + pos;
            breaks.push((absolute, heading.text.clone()));
            search_from = absolute + heading.text.len();
        }
    }

    if breaks.is_empty() {
        return vec![Section {
            heading: None,
            text: content.to_string(),
            start: 0,
        }];
    }

    let mut sections = Vec::new();
    if breaks[0].0 > 0 {
        sections.push(Section {
            heading: None,
            text: content[..breaks[0].0].to_string(),
            start: 0,
        });
    }
    for (i, (start, heading)) in breaks.iter().enumerate() {
        let end = breaks.get(i + 1).map(|(p, _)| *p).unwrap_or(content.len());
        sections.push(Section {
            heading: Some(heading.clone()),
            text: content[*start..end].to_string(),
            start: *start,
        });
    }
    sections
}

fn split_section(section: &Section, opts: &ChunkOptions, pieces: &mut Vec<ChunkPiece>) {
    let text = section.text.trim();
    if text.is_empty() {
        return;
    }

    if text.len() <= opts.max_chunk_size {
        pieces.push(ChunkPiece {
            content: text.to_string(),
            heading: section.heading.clone(),
            start_offset: section.start,
            end_offset: section.start + text.len(),
        });
        return;
    }

    let mut acc = Accumulator {
        opts,
        heading: &section.heading,
        cursor: section.start,
        prev_tail: None,
        pieces,
    };

    let para_re = Regex::new(r"\n{2,}").expect("static regex");
    let mut buf = String::new();

    for para in para_re.split(text) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if para.len() > opts.max_chunk_size {
            // A single paragraph over the limit: flush, then fall back
            // through sentence and word splitting.
            acc.flush(&mut buf);
            for block in split_long_block(para, opts.max_chunk_size) {
                acc.emit(&block);
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > opts.max_chunk_size && !buf.is_empty() {
            if buf.len() >= opts.min_chunk_size {
                acc.flush(&mut buf);
            }
            // A buffer still under min_chunk_size keeps accumulating and
            // may run slightly over the limit.
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    acc.flush(&mut buf);
}

struct Accumulator<'a> {
    opts: &'a ChunkOptions,
    heading: &'a Option<String>,
    cursor: usize,
    prev_tail: Option<String>,
    pieces: &'a mut Vec<ChunkPiece>,
}

impl Accumulator<'_> {
    fn flush(&mut self, buf: &mut String) {
        if !buf.trim().is_empty() {
            let body = std::mem::take(buf);
            self.emit(body.trim());
        } else {
            buf.clear();
        }
    }

    fn emit(&mut self, body: &str) {
        if body.is_empty() {
            return;
        }
        let content = match (&self.prev_tail, self.opts.overlap > 0) {
            (Some(tail), true) => format!("{}\n{}", tail, body),
            _ => body.to_string(),
        };
        let start = self.cursor;
        self.cursor += body.len();
        self.prev_tail = Some(tail_chars(body, self.opts.overlap));
        self.pieces.push(ChunkPiece {
            content,
            heading: self.heading.clone(),
            start_offset: start,
            end_offset: start + body.len(),
        });
    }
}

/// Sentence-then-word fallback for a block longer than the chunk limit.
/// No returned piece exceeds the limit except a single word that is
/// itself longer.
fn split_long_block(block: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for sentence in split_sentences(block) {
        if sentence.len() > max {
            flush_into(&mut buf, &mut out);
            split_words(sentence, max, &mut out);
            continue;
        }
        let would_be = if buf.is_empty() {
            sentence.len()
        } else {
            buf.len() + 1 + sentence.len()
        };
        if would_be > max {
            flush_into(&mut buf, &mut out);
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(sentence);
    }
    flush_into(&mut buf, &mut out);
    out
}

fn split_words(text: &str, max: usize, out: &mut Vec<String>) {
    let mut buf = String::new();
    for word in text.split_whitespace() {
        let would_be = if buf.is_empty() {
            word.len()
        } else {
            buf.len() + 1 + word.len()
        };
        if would_be > max {
            flush_into(&mut buf, out);
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(word);
    }
    flush_into(&mut buf, out);
}

fn flush_into(buf: &mut String, out: &mut Vec<String>) {
    if !buf.is_empty() {
        out.push(std::mem::take(buf));
    }
}

/// Split on `[.!?]` followed by whitespace, keeping the punctuation with
/// the preceding sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let re = Regex::new(r"[.!?]\s+").expect("static regex");
    let mut out = Vec::new();
    let mut last = 0usize;
    for m in re.find_iter(text) {
        let end = m.start() + 1;
        let sentence = text[last..end].trim();
        if !sentence.is_empty() {
            out.push(sentence);
        }
        last = m.end();
    }
    if last < text.len() {
        let tail = text[last..].trim();
        if !tail.is_empty() {
            out.push(tail);
        }
    }
    out
}

/// Last `n` characters of a string, on char boundaries.
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        s.to_string()
    } else {
        s.chars().skip(count - n).collect()
    }
}

/// A final undersized chunk is folded into its neighbour when their
/// combined length still fits.
fn merge_trailing_small(pieces: &mut Vec<ChunkPiece>, opts: &ChunkOptions) {
    if pieces.len() < 2 {
        return;
    }
    let last = &pieces[pieces.len() - 1];
    let prev = &pieces[pieces.len() - 2];
    if last.content.len() < opts.min_chunk_size
        && prev.content.len() + 2 + last.content.len() <= opts.max_chunk_size
    {
        let last = pieces.pop().expect("len checked");
        let prev = pieces.last_mut().expect("len checked");
        prev.content.push_str("\n\n");
        prev.content.push_str(&last.content);
        prev.end_offset = last.end_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(level: u8, text: &str, offset: usize) -> Heading {
        Heading {
            level,
            text: text.to_string(),
            offset,
        }
    }

    fn opts(max: usize, min: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            max_chunk_size: max,
            min_chunk_size: min,
            overlap,
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(split_chunks("", &[], &ChunkOptions::default()).is_empty());
        assert!(split_chunks("   \n\n  ", &[], &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk_carries_first_heading() {
        let headings = vec![heading(1, "Intro", 0)];
        let chunks = split_chunks("Intro\n\nShort body.", &headings, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading.as_deref(), Some("Intro"));
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn test_sections_split_on_headings() {
        let text = "Alpha\nalpha body text that goes on.\n\nBeta\nbeta body text that goes on.";
        let headings = vec![heading(1, "Alpha", 0), heading(1, "Beta", 0)];
        let chunks = split_chunks(text, &headings, &opts(40, 5, 0));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading.as_deref(), Some("Alpha"));
        assert!(chunks[0].content.contains("alpha body"));
        assert_eq!(chunks[1].heading.as_deref(), Some("Beta"));
        assert!(chunks[1].content.contains("beta body"));
    }

    #[test]
    fn test_preamble_before_first_heading_has_no_heading() {
        let text = "Preamble text before anything substantial appears.\n\nAlpha\nalpha body text that goes on and on.";
        let headings = vec![heading(1, "Alpha", 0)];
        let chunks = split_chunks(text, &headings, &opts(60, 5, 0));
        assert!(chunks[0].heading.is_none());
        assert!(chunks[0].content.contains("Preamble"));
        assert_eq!(chunks[1].heading.as_deref(), Some("Alpha"));
    }

    #[test]
    fn test_oversize_section_splits_on_paragraphs() {
        let paras: Vec<String> = (0..6).map(|i| format!("Paragraph number {} with some filler words.", i)).collect();
        let text = paras.join("\n\n");
        let chunks = split_chunks(&text, &[], &opts(100, 10, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 100, "chunk too big: {}", chunk.content.len());
        }
    }

    #[test]
    fn test_overlap_prepended_to_following_chunk() {
        let paras: Vec<String> = (0..6).map(|i| format!("Paragraph number {} with some filler words.", i)).collect();
        let text = paras.join("\n\n");
        let chunks = split_chunks(&text, &[], &opts(100, 10, 20));
        assert!(chunks.len() > 1);
        let first_tail: String = {
            let c = &chunks[0].content;
            let count = c.chars().count();
            c.chars().skip(count.saturating_sub(20)).collect()
        };
        assert!(
            chunks[1].content.starts_with(&first_tail),
            "second chunk should start with the previous chunk's tail"
        );
    }

    #[test]
    fn test_long_paragraph_falls_back_to_sentences() {
        let sentences: Vec<String> = (0..10).map(|i| format!("This is sentence number {} of the piece.", i)).collect();
        let text = sentences.join(" ");
        let chunks = split_chunks(&text, &[], &opts(120, 10, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 120);
        }
    }

    #[test]
    fn test_unbroken_text_falls_back_to_words() {
        let text = "word ".repeat(200);
        let chunks = split_chunks(&text, &[], &opts(50, 5, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 50);
        }
    }

    #[test]
    fn test_single_word_longer_than_limit_survives() {
        let long_word = "x".repeat(80);
        let text = format!("{} trailing words here to push the total over the limit, with more and more filler appended", long_word);
        let chunks = split_chunks(&text, &[], &opts(50, 5, 0));
        assert!(chunks.iter().any(|c| c.content.contains(&long_word)));
    }

    #[test]
    fn test_trailing_small_chunk_merged() {
        // Two paragraphs where the second is tiny: expect a merge.
        let text = format!("{}\n\n{}\n\ntiny", "a".repeat(60), "b".repeat(60));
        let chunks = split_chunks(&text, &[], &opts(80, 20, 0));
        let last = chunks.last().unwrap();
        assert!(
            last.content.ends_with("tiny") && last.content.len() > 20,
            "trailing fragment should merge into its neighbour: {:?}",
            chunks.iter().map(|c| c.content.len()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_offsets_monotonic() {
        let paras: Vec<String> = (0..8).map(|i| format!("Paragraph {} body with assorted filler text.", i)).collect();
        let text = paras.join("\n\n");
        let chunks = split_chunks(&text, &[], &opts(90, 10, 10));
        for pair in chunks.windows(2) {
            assert!(pair[0].start_offset <= pair[1].start_offset);
        }
        for chunk in &chunks {
            assert!(chunk.start_offset <= chunk.end_offset);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta and a longer run of text to split over multiple chunks for determinism checking.";
        let a = split_chunks(text, &[], &opts(40, 5, 10));
        let b = split_chunks(text, &[], &opts(40, 5, 10));
        assert_eq!(a, b);
    }
}
