// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The path-matcher: glob-style path expressions bucketed by depth, plus an
//! optional query-filter hook on the payload Message. See spec §4.2.

use std::collections::HashMap;
use std::rc::Rc;

use crate::message::Message;

/// Returns the number of non-empty, slash-separated clauses in `path`
/// (a leading slash is ignored).
pub fn get_path_depth(path: &str) -> u32 {
    path.split('/').filter(|c| !c.is_empty()).count() as u32
}

fn clauses(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Public alias of [`clauses`] for callers outside this module that need
/// to walk a path's clauses one tree level at a time (the data-node tree's
/// traversal, in particular).
pub fn path_clauses(path: &str) -> Vec<&str> {
    clauses(path)
}

/// Tests a single path clause (one tree level) against a single pattern
/// clause, which may contain glob/regex metacharacters. Used by the
/// data-node tree when descending level by level instead of testing a
/// whole path at once.
pub fn clause_matches(pattern_clause: &str, candidate: &str) -> bool {
    ClauseMatcher::compile(pattern_clause).matches(candidate)
}

/// True iff `clause` contains a glob/regex metacharacter, i.e. could match
/// more than one literal value. Drives the data-tree's choice between O(1)
/// child lookup (no metacharacters) and a linear scan of all children.
pub fn can_wildcard_string_match_multiple_values(clause: &str) -> bool {
    clause.chars().any(|c| matches!(c, '*' | '?' | '[' | ']' | '.' | '+' | '^' | '$' | '(' | ')' | '|'))
}

/// A single compiled glob/regex clause matcher.
#[derive(Debug, Clone)]
enum ClauseMatcher {
    Literal(String),
    Glob(GlobPattern),
}

impl ClauseMatcher {
    fn compile(clause: &str) -> ClauseMatcher {
        if can_wildcard_string_match_multiple_values(clause) {
            ClauseMatcher::Glob(GlobPattern::compile(clause))
        } else {
            ClauseMatcher::Literal(clause.to_owned())
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            ClauseMatcher::Literal(lit) => lit == candidate,
            ClauseMatcher::Glob(glob) => glob.matches(candidate),
        }
    }
}

/// A `?`/`*`/`[...]` glob, compiled once into a small instruction list so
/// matching doesn't re-parse the pattern on every path tested.
#[derive(Debug, Clone)]
struct GlobPattern {
    tokens: Vec<GlobToken>,
}

#[derive(Debug, Clone)]
enum GlobToken {
    Char(char),
    AnySingle,
    AnyRun,
    Class { chars: Vec<char>, ranges: Vec<(char, char)>, negate: bool },
}

impl GlobPattern {
    fn compile(pattern: &str) -> GlobPattern {
        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => tokens.push(GlobToken::AnyRun),
                '?' => tokens.push(GlobToken::AnySingle),
                '[' => {
                    let mut class_chars = Vec::new();
                    let mut ranges = Vec::new();
                    let negate = chars.peek() == Some(&'!') || chars.peek() == Some(&'^');
                    if negate {
                        chars.next();
                    }
                    while let Some(&cc) = chars.peek() {
                        if cc == ']' {
                            chars.next();
                            break;
                        }
                        chars.next();
                        if chars.peek() == Some(&'-') {
                            let mut lookahead = chars.clone();
                            lookahead.next();
                            if let Some(&end) = lookahead.peek() {
                                if end != ']' {
                                    chars.next();
                                    chars.next();
                                    ranges.push((cc, end));
                                    continue;
                                }
                            }
                        }
                        class_chars.push(cc);
                    }
                    tokens.push(GlobToken::Class { chars: class_chars, ranges, negate });
                }
                other => tokens.push(GlobToken::Char(other)),
            }
        }

        GlobPattern { tokens }
    }

    fn matches(&self, candidate: &str) -> bool {
        let chars: Vec<char> = candidate.chars().collect();
        Self::match_from(&self.tokens, &chars)
    }

    fn match_from(tokens: &[GlobToken], input: &[char]) -> bool {
        match tokens.split_first() {
            None => input.is_empty(),
            Some((GlobToken::AnyRun, rest)) => {
                for split in 0..=input.len() {
                    if Self::match_from(rest, &input[split..]) {
                        return true;
                    }
                }
                false
            }
            Some((GlobToken::AnySingle, rest)) => {
                !input.is_empty() && Self::match_from(rest, &input[1..])
            }
            Some((GlobToken::Char(expected), rest)) => {
                matches!(input.first(), Some(c) if c == expected) && Self::match_from(rest, &input[1..])
            }
            Some((GlobToken::Class { chars, ranges, negate }, rest)) => match input.first() {
                Some(&c) => {
                    let hit = chars.contains(&c) || ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
                    (hit != *negate) && Self::match_from(rest, &input[1..])
                }
                None => false,
            },
        }
    }
}

/// An optional predicate over a Message payload, attached to a
/// `PathMatcherEntry`. Boxed to allow arbitrary closures/structs.
pub type QueryFilter = Rc<dyn Fn(&Message) -> bool>;

struct PathMatcherEntry {
    clause_matchers: Vec<ClauseMatcher>,
    filter: Option<QueryFilter>,
}

impl PathMatcherEntry {
    fn matches(&self, path_clauses: &[&str], payload: Option<&Message>) -> bool {
        if self.clause_matchers.len() != path_clauses.len() {
            return false;
        }
        let clauses_match = self
            .clause_matchers
            .iter()
            .zip(path_clauses.iter())
            .all(|(m, c)| m.matches(c));

        if !clauses_match {
            return false;
        }

        match (&self.filter, payload) {
            (Some(filter), Some(msg)) => filter(msg),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// A compiled set of path patterns, bucketed by depth for fast rejection of
/// paths whose clause count doesn't match any stored pattern.
#[derive(Default)]
pub struct PathMatcher {
    entries_by_depth: HashMap<u32, Vec<(String, PathMatcherEntry)>>,
}

impl PathMatcher {
    pub fn new() -> PathMatcher {
        PathMatcher::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries_by_depth.values().all(|v| v.is_empty())
    }

    pub fn put_path_string(&mut self, path: &str, filter: Option<QueryFilter>) {
        let depth = get_path_depth(path);
        let clause_matchers = clauses(path).iter().map(|c| ClauseMatcher::compile(c)).collect();
        let entry = PathMatcherEntry { clause_matchers, filter };
        let bucket = self.entries_by_depth.entry(depth).or_default();
        bucket.retain(|(existing_path, _)| existing_path != path);
        bucket.push((path.to_owned(), entry));
    }

    pub fn remove_path_string(&mut self, path: &str) -> bool {
        let depth = get_path_depth(path);
        if let Some(bucket) = self.entries_by_depth.get_mut(&depth) {
            let before = bucket.len();
            bucket.retain(|(existing_path, _)| existing_path != path);
            return bucket.len() != before;
        }
        false
    }

    /// Tests `path` against every stored pattern at the matching depth,
    /// consulting `optional_payload` for entries that carry a query filter.
    pub fn matches_path(&self, path: &str, optional_payload: Option<&Message>) -> bool {
        let depth = get_path_depth(path);
        let path_clauses = clauses(path);
        match self.entries_by_depth.get(&depth) {
            Some(bucket) => bucket.iter().any(|(_, entry)| entry.matches(&path_clauses, optional_payload)),
            None => false,
        }
    }

    pub fn num_filters(&self) -> usize {
        self.entries_by_depth
            .values()
            .flat_map(|bucket| bucket.iter())
            .filter(|(_, entry)| entry.filter.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_ignores_leading_slash_and_empty_clauses() {
        assert_eq!(get_path_depth("/a/b/c"), 3);
        assert_eq!(get_path_depth("a/b/c"), 3);
        assert_eq!(get_path_depth(""), 0);
        assert_eq!(get_path_depth("//a//b/"), 2);
    }

    #[test]
    fn literal_clause_matches_exactly() {
        let mut m = PathMatcher::new();
        m.put_path_string("foo/bar", None);
        assert!(m.matches_path("foo/bar", None));
        assert!(!m.matches_path("foo/baz", None));
        assert!(!m.matches_path("foo/bar/baz", None));
    }

    #[test]
    fn star_clause_matches_one_segment() {
        let mut m = PathMatcher::new();
        m.put_path_string("foo/*", None);
        assert!(m.matches_path("foo/hello", None));
        assert!(!m.matches_path("foo/hello/world", None));
    }

    #[test]
    fn glob_metacharacters_match_partial_segments() {
        let mut m = PathMatcher::new();
        m.put_path_string("foo/h*", None);
        assert!(m.matches_path("foo/hello", None));
        assert!(!m.matches_path("foo/world", None));

        let mut m2 = PathMatcher::new();
        m2.put_path_string("foo/[hw]ello", None);
        assert!(m2.matches_path("foo/hello", None));
        assert!(m2.matches_path("foo/wello", None));
        assert!(!m2.matches_path("foo/zello", None));
    }

    #[test]
    fn query_filter_gates_the_match() {
        let mut m = PathMatcher::new();
        let filter: QueryFilter = Rc::new(|msg: &Message| msg.find_i32("val", 0) == Some(7));
        m.put_path_string("foo/bar", Some(filter));

        let mut matching = Message::new(0);
        matching.add_i32("val", 7);
        assert!(m.matches_path("foo/bar", Some(&matching)));

        let mut not_matching = Message::new(0);
        not_matching.add_i32("val", 8);
        assert!(!m.matches_path("foo/bar", Some(&not_matching)));

        assert!(!m.matches_path("foo/bar", None));
    }

    #[test]
    fn can_wildcard_detection() {
        assert!(!can_wildcard_string_match_multiple_values("literal"));
        assert!(can_wildcard_string_match_multiple_values("h*"));
        assert!(can_wildcard_string_match_multiple_values("[ab]"));
    }
}
