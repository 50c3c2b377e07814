//! Identifier queries.
//!
//! A query names a file kind and a path pattern:
//!
//! ```text
//! TimeSeries@/pa/flux/{raw,cal}/[100:200]
//! b@/configs/*.xml
//! ```
//!
//! The kind is `TimeSeries`, `MjdTimeSeries` or `Blob` (case-insensitive),
//! or the abbreviations `ts`, `mjd` and `b`. Each `/` component of the
//! pattern is matched against the component of the id at the same depth,
//! so a pattern only matches ids with as many components as it has. Inside a
//! component `*` matches any run of characters, `?` one character,
//! `{a,b}` one of the listed literals and `[lo:hi]` a decimal integer in
//! the inclusive range.

use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::store::FileStore;
use crate::types::FileKind;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    One,
    Choice(Vec<String>),
    Range(i64, i64),
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsQuery {
    text: String,
    kind: FileKind,
    components: Vec<Vec<Segment>>,
}

impl FsQuery {
    /// Parses `<kind>@<pattern>`.
    ///
    /// # Errors
    ///
    /// Returns `Query` with the reason for a malformed query.
    pub fn parse(text: &str) -> FsResult<Self> {
        let fail = |message: &str| StorageFault::Query {
            query: text.to_string(),
            message: message.to_string(),
        };
        let (kind, pattern) = text.split_once('@').ok_or_else(|| fail("missing '@'"))?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "timeseries" | "ts" | "t" => FileKind::TimeSeries,
            "mjdtimeseries" | "mjd" | "m" => FileKind::Mjd,
            "blob" | "b" => FileKind::Blob,
            _ => return Err(fail("unknown data type")),
        };
        let body = pattern
            .strip_prefix('/')
            .ok_or_else(|| fail("pattern must start with '/'"))?;
        let components = body
            .split('/')
            .map(|c| parse_component(c).map_err(|m| fail(&m)))
            .collect::<FsResult<Vec<_>>>()?;
        Ok(Self {
            text: text.to_string(),
            kind,
            components,
        })
    }

    /// Kind of file the query selects.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Original query text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns true if `id` matches the pattern.
    #[must_use]
    pub fn matches(&self, id: &FsId) -> bool {
        let mut parts = id.components();
        for segments in &self.components {
            match parts.next() {
                Some(part) => {
                    if !match_segments(segments, part) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        parts.next().is_none()
    }

    /// Leading components without wildcards, as an id prefix.
    fn literal_prefix(&self) -> Option<String> {
        let mut prefix = String::new();
        for segments in &self.components {
            match segments.as_slice() {
                [Segment::Literal(s)] => {
                    prefix.push('/');
                    prefix.push_str(s);
                }
                _ => break,
            }
        }
        (!prefix.is_empty()).then_some(prefix)
    }

    /// Mapped ids of the query's kind that match, in key order.
    pub(crate) fn scan(&self, store: &FileStore) -> FsResult<Vec<FsId>> {
        let mut out = Vec::new();
        match self.literal_prefix() {
            Some(prefix) => {
                let start = FsId::new(&prefix)?;
                for entry in store.iter_from(self.kind, start) {
                    let (id, _) = entry?;
                    if !id.as_str().starts_with(&prefix) {
                        break;
                    }
                    if self.matches(&id) {
                        out.push(id);
                    }
                }
            }
            None => {
                for entry in store.iter(self.kind) {
                    let (id, _) = entry?;
                    if self.matches(&id) {
                        out.push(id);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Distinct parent paths of `ids`, sorted.
#[must_use]
pub fn parent_paths(ids: &[FsId]) -> Vec<String> {
    ids.iter()
        .map(|id| id.path().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn parse_component(text: &str) -> Result<Vec<Segment>, String> {
    if text.is_empty() {
        return Err("empty path component".into());
    }
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars();
    let flush = |literal: &mut String, segments: &mut Vec<Segment>| {
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(literal)));
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                flush(&mut literal, &mut segments);
                if segments.last() != Some(&Segment::Any) {
                    segments.push(Segment::Any);
                }
            }
            '?' => {
                flush(&mut literal, &mut segments);
                segments.push(Segment::One);
            }
            '{' => {
                flush(&mut literal, &mut segments);
                let body = take_until(&mut chars, '}')?;
                let options: Vec<String> = body.split(',').map(str::to_string).collect();
                if options.iter().any(String::is_empty) {
                    return Err("empty alternative".into());
                }
                segments.push(Segment::Choice(options));
            }
            '[' => {
                flush(&mut literal, &mut segments);
                let body = take_until(&mut chars, ']')?;
                let (lo, hi) = body
                    .split_once(':')
                    .ok_or_else(|| "range needs 'lo:hi'".to_string())?;
                let lo: i64 = lo.trim().parse().map_err(|_| format!("bad bound {lo:?}"))?;
                let hi: i64 = hi.trim().parse().map_err(|_| format!("bad bound {hi:?}"))?;
                if lo > hi {
                    return Err(format!("empty range [{lo}:{hi}]"));
                }
                segments.push(Segment::Range(lo, hi));
            }
            '}' | ']' => return Err(format!("unbalanced {c:?}")),
            '\\' => literal.push(chars.next().ok_or("trailing escape")?),
            c => literal.push(c),
        }
    }
    flush(&mut literal, &mut segments);
    Ok(segments)
}

fn take_until(chars: &mut std::str::Chars<'_>, close: char) -> Result<String, String> {
    let mut body = String::new();
    for c in chars.by_ref() {
        if c == close {
            return Ok(body);
        }
        body.push(c);
    }
    Err(format!("missing {close:?}"))
}

fn match_segments(segments: &[Segment], text: &str) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return text.is_empty();
    };
    match first {
        Segment::Literal(s) => text
            .strip_prefix(s.as_str())
            .is_some_and(|tail| match_segments(rest, tail)),
        Segment::One => {
            let mut chars = text.chars();
            chars.next().is_some() && match_segments(rest, chars.as_str())
        }
        Segment::Any => text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .any(|i| match_segments(rest, &text[i..])),
        Segment::Choice(options) => options.iter().any(|o| {
            text.strip_prefix(o.as_str())
                .is_some_and(|tail| match_segments(rest, tail))
        }),
        Segment::Range(lo, hi) => {
            let sign = usize::from(text.starts_with('-'));
            let digits = text[sign..]
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count();
            (1..=digits).any(|n| {
                let end = sign + n;
                text[..end]
                    .parse::<i64>()
                    .is_ok_and(|v| (*lo..=*hi).contains(&v))
                    && match_segments(rest, &text[end..])
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FsId {
        FsId::new(s).unwrap()
    }

    #[test]
    fn kinds_and_abbreviations() {
        assert_eq!(FsQuery::parse("TimeSeries@/a").unwrap().kind(), FileKind::TimeSeries);
        assert_eq!(FsQuery::parse("mjd@/a").unwrap().kind(), FileKind::Mjd);
        assert_eq!(FsQuery::parse("B@/a").unwrap().kind(), FileKind::Blob);
        assert!(matches!(
            FsQuery::parse("table@/a"),
            Err(StorageFault::Query { .. })
        ));
        assert!(FsQuery::parse("ts/a").is_err());
        assert!(FsQuery::parse("ts@a").is_err());
    }

    #[test]
    fn literal_and_glob_components() {
        let q = FsQuery::parse("ts@/pa/*/flux").unwrap();
        assert!(q.matches(&id("/pa/target/flux")));
        assert!(!q.matches(&id("/pa/target/flux/1")));
        assert!(!q.matches(&id("/pa/flux")));

        let q = FsQuery::parse("ts@/pa/t?r*x").unwrap();
        assert!(q.matches(&id("/pa/tarx")));
        assert!(q.matches(&id("/pa/torrrrx")));
        assert!(!q.matches(&id("/pa/trx")));
    }

    #[test]
    fn alternatives_and_ranges() {
        let q = FsQuery::parse("ts@/pa/{raw,cal}/[10:20]").unwrap();
        assert!(q.matches(&id("/pa/raw/10")));
        assert!(q.matches(&id("/pa/cal/20")));
        assert!(!q.matches(&id("/pa/cal/21")));
        assert!(!q.matches(&id("/pa/other/15")));

        let q = FsQuery::parse("ts@/m[-2:3]x").unwrap();
        assert!(q.matches(&id("/m-1x")));
        assert!(q.matches(&id("/m3x")));
        assert!(!q.matches(&id("/m4x")));

        assert!(FsQuery::parse("ts@/a/[5:1]").is_err());
        assert!(FsQuery::parse("ts@/a/{x").is_err());
        assert!(FsQuery::parse("ts@/a//b").is_err());
    }

    #[test]
    fn prefix_stops_at_first_wildcard() {
        let q = FsQuery::parse("ts@/pa/flux/*/[1:2]").unwrap();
        assert_eq!(q.literal_prefix().as_deref(), Some("/pa/flux"));
        assert_eq!(FsQuery::parse("ts@/*").unwrap().literal_prefix(), None);
    }

    #[test]
    fn parent_paths_are_distinct() {
        let ids = vec![id("/a/b/1"), id("/a/b/2"), id("/a/c/1")];
        assert_eq!(parent_paths(&ids), vec!["/a/b".to_string(), "/a/c".to_string()]);
    }
}
