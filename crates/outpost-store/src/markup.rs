//! Boundary to the rich-text markup parser.
//!
//! The store only needs one thing from the parser: the list of object
//! references in a body, with the byte span of each referenced token so it
//! can be rewritten in place.

use std::ops::Range;
use std::sync::OnceLock;

use outpost_shared::Token;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Plain link to another object.
    Link,
    /// Embedded file; keeps the file alive through orphan cleanup.
    Attachment,
    /// User mention; mentioned users are subscribed to tasks.
    Mention,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpan {
    /// Byte range of the token text inside the body.
    pub range: Range<usize>,
    pub token: Token,
    pub kind: ReferenceKind,
}

pub trait MarkupParser: Send + Sync {
    /// References in document order.
    fn references(&self, body: &str) -> Vec<ReferenceSpan>;
}

/// Default parser for the `{{link:TOKEN}}` / `{{file:TOKEN}}` /
/// `{{user:TOKEN}}` reference syntax.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceMarkup;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{(link|file|user):([A-Za-z0-9_-]+)\}\}").expect("static pattern")
    })
}

impl MarkupParser for BraceMarkup {
    fn references(&self, body: &str) -> Vec<ReferenceSpan> {
        reference_pattern()
            .captures_iter(body)
            .filter_map(|caps| {
                let tag = caps.get(1)?;
                let token = caps.get(2)?;
                let kind = match tag.as_str() {
                    "file" => ReferenceKind::Attachment,
                    "user" => ReferenceKind::Mention,
                    _ => ReferenceKind::Link,
                };
                Some(ReferenceSpan {
                    range: token.range(),
                    token: Token::new(token.as_str()).ok()?,
                    kind,
                })
            })
            .collect()
    }
}

/// Tokens referenced with the given kind, deduplicated, in first-seen order.
pub fn tokens_of_kind(spans: &[ReferenceSpan], kind: ReferenceKind) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::new();
    for span in spans.iter().filter(|s| s.kind == kind) {
        if !out.contains(&span.token) {
            out.push(span.token.clone());
        }
    }
    out
}

/// Replace every span referencing `old` with `new`, last match first so the
/// offsets of earlier matches stay valid.
pub fn rewrite_references(body: &str, spans: &[ReferenceSpan], old: &Token, new: &Token) -> String {
    let mut matches: Vec<&ReferenceSpan> = spans.iter().filter(|s| &s.token == old).collect();
    matches.sort_by_key(|s| s.range.start);

    let mut out = body.to_string();
    for span in matches.into_iter().rev() {
        out.replace_range(span.range.clone(), new.as_str());
    }
    out
}
