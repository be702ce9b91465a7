//! Perl/ECMAScript-flavored regular expressions on a lock-step Pike VM.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! pattern text  ──Parser──>  Ast  ──Compiler──>  Program  ──Matcher──>  capture slots
//! ```
//!
//! The parser is a single-pass recursive descent over the pattern's
//! characters. It tracks the flag set (`m`, `s`, `i`), numbers capture
//! groups left to right starting at 1 (slot 0 is the whole match), records
//! named groups in insertion order, and rejects backreferences to groups
//! that do not exist yet or are still open. Case-insensitivity is resolved
//! here, at parse time: literals and bracketed classes are expanded through
//! the simple case-folding orbit map, so the matcher's inner loop never
//! consults a flag.
//!
//! The compiler lowers the tree to a flat program of VM instructions. Every
//! program starts with the same three-instruction preamble:
//!
//! ```text
//! 0: split 3, 1        ; prefer starting the match here
//! 1: char 0-10ffff     ; otherwise consume one code point...
//! 2: jump 0            ; ...and try again
//! 3: save 0            ; open the whole-match capture
//! ```
//!
//! which makes "find the leftmost match anywhere" a property of the program
//! itself rather than of the matcher's driver loop: the scanning thread at
//! instruction 1 is always the lowest-priority thread alive, so the first
//! recorded match cuts it off and no later start can win.
//!
//! The matcher is the Thompson/Pike "N threads in lock-step" simulation.
//! Two thread lists, `clist` and `nlist`, hold the threads live at the
//! current and next input position; each step drains `clist` in priority
//! order, resolves every zero-width instruction immediately in `addthread`
//! (following both arms of `split`, evaluating assertions against the
//! current position, writing `save` slots), and parks consuming
//! instructions in `nlist` at their post-consumption position. The lists
//! swap and the cursor advances one code point. Reaching `matched` records
//! the thread's capture slots and discards the lower-priority remainder of
//! `clist`, which is exactly leftmost-first semantics: earlier alternation
//! arms and the preferred direction of every quantifier win, and a match
//! starting earlier in the input beats any later one.
//!
//! ## Thread deduplication
//!
//! `lastlist[pc]` remembers the last input position at which `pc` was
//! added. `addthread` returns immediately when `lastlist[pc]` equals the
//! thread's position, so at most one thread per instruction exists per
//! position and a whole match costs O(program × input) steps; there is no
//! backtracking and no catastrophic blowup. The one exception is opted
//! into by the pattern itself: a backreference makes thread state depend
//! on captured text, which the dedup key cannot see, so programs containing
//! one refill `lastlist` at every step (deduplicating within a position
//! only) and give up the linear-time bound for correctness.
//!
//! ## Capture slots
//!
//! Each thread owns an array of `2 × groups` byte offsets, shared
//! copy-on-write behind an [`Rc`]: a `split` hands the same array to both
//! arms and a clone is paid only when a lower-priority thread actually
//! executes a `save` while the array is shared. The higher-priority branch
//! therefore always inherits the original, the cheap direction, since it
//! is also the branch that usually survives.
//!
//! ## Offsets
//!
//! All offsets (capture slots, [`MatchResult::before`]/[`MatchResult::after`]
//! boundaries) are byte offsets into the input `&str`, and consuming steps
//! advance by the UTF-8 width of the code point consumed. Assertions probe
//! single bytes (`\n`, ASCII word characters), which is exact in UTF-8
//! because those bytes never occur inside a multi-byte sequence.
//!
//! Compiled [`Regexp`]s are immutable and freely shareable across threads;
//! every [`execute`](Regexp::execute) call owns its scratch (thread lists,
//! `lastlist`, slot arrays) and runs concurrently with any other call.

use std::fmt;
use std::mem;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use log::trace;

mod unicode;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// What went wrong while compiling a pattern.
///
/// Compilation is the only fallible operation; matching never errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A parser invariant was violated. Unreachable in correct builds.
    InternalError,
    /// A bracketed class with reversed range endpoints, an unclosed or
    /// unknown `\p{...}` property, or a class escape used as a range
    /// endpoint.
    InvalidCharClass,
    /// An unknown escape, a malformed `\u...`, a malformed `\k<...>`, a
    /// backreference to a missing or still-open group, or the reserved
    /// `\c`.
    InvalidEscape,
    /// A named group with an empty, malformed, or duplicate name, or a
    /// name missing its closing `>`.
    InvalidNamedCapture,
    /// A malformed `{...}` quantifier body.
    InvalidRepeatOp,
    /// `{n,m}` with `m < n`.
    InvalidRepeatSize,
    /// A `[` without its `]`, or a stray `]`.
    MissingBracket,
    /// A `(` without its `)`.
    MissingParenthesis,
    /// A quantifier with nothing to repeat, including bare `{}`.
    MissingRepeatArgument,
    /// The pattern ends in a lone `\`.
    TrailingBackslash,
    /// A stray `)`.
    UnexpectedParenthesis,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InternalError => "internal error",
            ErrorKind::InvalidCharClass => "invalid character class",
            ErrorKind::InvalidEscape => "invalid escape",
            ErrorKind::InvalidNamedCapture => "invalid named capture",
            ErrorKind::InvalidRepeatOp => "invalid repeat operator",
            ErrorKind::InvalidRepeatSize => "invalid repeat size",
            ErrorKind::MissingBracket => "missing bracket",
            ErrorKind::MissingParenthesis => "missing parenthesis",
            ErrorKind::MissingRepeatArgument => "missing repeat argument",
            ErrorKind::TrailingBackslash => "trailing backslash",
            ErrorKind::UnexpectedParenthesis => "unexpected parenthesis",
        }
    }
}

/// An error returned when a pattern fails to compile.
///
/// Carries the [`ErrorKind`] and the unconsumed tail of the pattern at the
/// point of failure, as a diagnostic fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    fragment: String,
}

impl Error {
    /// The error category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The unconsumed suffix of the pattern at the point of failure.
    pub fn fragment(&self) -> &str {
        &self.fragment
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fragment.is_empty() {
            write!(f, "{} at end of pattern", self.kind.as_str())
        } else {
            write!(f, "{} near `{}`", self.kind.as_str(), self.fragment)
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Character ranges
// ---------------------------------------------------------------------------

/// Largest Unicode code point.
const MAX_CODE_POINT: u32 = 0x10FFFF;

/// An inclusive range of code points.
///
/// A character class is a list of these; after [`simplify`] the list is
/// sorted, non-overlapping, and non-adjacent, which [`contains`] relies on
/// for binary search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CharRange {
    start: u32,
    end: u32,
}

impl CharRange {
    fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end && end <= MAX_CODE_POINT);
        Self { start, end }
    }

    /// A one-code-point range.
    fn single(cp: u32) -> Self {
        Self::new(cp, cp)
    }
}

/// Sort a range list and merge overlapping or adjacent entries.
///
/// The result satisfies the normalization invariant (`start <= end`,
/// `end + 1 < next.start`). Idempotent; empty in, empty out.
fn simplify(ranges: &[CharRange]) -> Vec<CharRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| (r.start, r.end));

    let mut out: Vec<CharRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            // Merge when overlapping or directly adjacent.
            Some(last) if range.start <= last.end + 1 => {
                last.end = last.end.max(range.end);
            }
            _ => out.push(range),
        }
    }
    out
}

/// Everything in `[0, MAX_CODE_POINT]` not covered by `ranges`.
///
/// The input need not be normalized; the empty list complements to the
/// full code-point range.
fn complement(ranges: &[CharRange]) -> Vec<CharRange> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for range in simplify(ranges) {
        if range.start > next {
            out.push(CharRange::new(next, range.start - 1));
        }
        // `end + 1` may step past MAX_CODE_POINT; the final push below
        // guards on it.
        next = range.end + 1;
    }
    if next <= MAX_CODE_POINT {
        out.push(CharRange::new(next, MAX_CODE_POINT));
    }
    out
}

/// Binary-search membership test. `ranges` must be normalized.
fn contains(ranges: &[CharRange], cp: u32) -> bool {
    ranges
        .binary_search_by(|range| {
            if cp < range.start {
                std::cmp::Ordering::Greater
            } else if cp > range.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .is_ok()
}

/// The next code point in `cp`'s simple case-folding orbit, or `cp` itself
/// when the orbit has one element.
fn fold_next(cp: u32) -> u32 {
    match unicode::CASE_FOLDING.binary_search_by_key(&cp, |&(from, _)| from) {
        Ok(i) => unicode::CASE_FOLDING[i].1,
        Err(_) => cp,
    }
}

/// Expand a range list with every case-folding equivalent of its members.
///
/// For each code point in `ranges ∩ [MIN_FOLD, MAX_FOLD]` the full orbit is
/// walked until it closes on the starting point; the orbit structure of the
/// fold map guarantees termination, no step bound is needed. Code points
/// outside the fold interval pass through unchanged. The result is
/// re-normalized.
fn case_fold_expand(ranges: &[CharRange]) -> Vec<CharRange> {
    let mut out = ranges.to_vec();
    for range in ranges {
        let lo = range.start.max(unicode::MIN_FOLD);
        let hi = range.end.min(unicode::MAX_FOLD);
        for cp in lo..=hi {
            let mut folded = fold_next(cp);
            while folded != cp {
                out.push(CharRange::single(folded));
                folded = fold_next(folded);
            }
        }
    }
    simplify(&out)
}

// ---------------------------------------------------------------------------
// Unicode data access
// ---------------------------------------------------------------------------

/// Composite general categories, derived from the leaf tables on lookup.
static COMPOSITES: &[(&str, &[&str])] = &[
    ("L", &["Lu", "Ll", "Lt", "Lm", "Lo"]),
    ("LC", &["Lu", "Ll", "Lt"]),
    ("M", &["Mn", "Mc", "Me"]),
    ("N", &["Nd", "Nl", "No"]),
    ("P", &["Pc", "Pd", "Ps", "Pe", "Pi", "Pf", "Po"]),
    ("S", &["Sm", "Sc", "Sk", "So"]),
    ("Z", &["Zs", "Zl", "Zp"]),
    ("C", &["Cc", "Cf", "Co", "Cs", "Cn"]),
];

/// Resolve a property name (canonical, composite, or alias) to its
/// canonical name, or `None` if the name is unknown.
fn canonical_category(name: &str) -> Option<&'static str> {
    if name == "Cn" {
        return Some("Cn");
    }
    if let Some(&(canonical, _)) = unicode::CATEGORIES.iter().find(|&&(c, _)| c == name) {
        return Some(canonical);
    }
    if let Some(&(canonical, _)) = COMPOSITES.iter().find(|&&(c, _)| c == name) {
        return Some(canonical);
    }
    unicode::ALIASES
        .iter()
        .find(|&&(alias, _)| alias == name)
        .map(|&(_, canonical)| canonical)
}

/// The normalized range list of a canonical general category.
///
/// Composites concatenate their leaf tables; `Cn` is the complement of
/// everything assigned. Returns an empty list for unknown names, which
/// callers rule out via [`canonical_category`].
fn category_ranges(canonical: &str) -> Vec<CharRange> {
    if let Some(&(_, parts)) = COMPOSITES.iter().find(|&&(c, _)| c == canonical) {
        let mut all = Vec::new();
        for part in parts {
            all.extend(category_ranges(part));
        }
        return simplify(&all);
    }
    if canonical == "Cn" {
        let mut assigned = Vec::new();
        for &(_, table) in unicode::CATEGORIES {
            assigned.extend(table.iter().map(|&(s, e)| CharRange::new(s, e)));
        }
        return complement(&assigned);
    }
    unicode::CATEGORIES
        .iter()
        .find(|&&(c, _)| c == canonical)
        .map(|&(_, table)| table.iter().map(|&(s, e)| CharRange::new(s, e)).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Zero-width assertion kinds.
///
/// `BeginText`/`EndText` anchor at the input edges; `BeginLine`/`EndLine`
/// additionally match after/before a `U+000A`. The word-boundary pair uses
/// ASCII word characters (`[0-9A-Za-z_]`) only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AssertionKind {
    BeginText,
    EndText,
    BeginLine,
    EndLine,
    WordBoundary,
    NoWordBoundary,
}

/// A parsed pattern node. Immutable once constructed.
///
/// Everything that consumes exactly one code point (literals, `.`,
/// `\d`-style escapes, `\p{...}` properties, bracketed classes) collapses
/// to `Class`, so the compiler and matcher only ever see range lists.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Ast {
    /// Matches the empty string.
    Empty,
    /// Matches one code point inside `ranges`, or outside it when
    /// `negated`.
    Class { ranges: Vec<CharRange>, negated: bool },
    /// Zero-width predicate on the current position.
    Assertion(AssertionKind),
    /// Numbered capture group; `index >= 1`, index 0 is the whole match.
    Capture { index: usize, inner: Box<Ast> },
    ZeroOrMore { greedy: bool, inner: Box<Ast> },
    OneOrMore { greedy: bool, inner: Box<Ast> },
    ZeroOrOne { greedy: bool, inner: Box<Ast> },
    /// Counted repetition; `max == None` means unbounded.
    Repeat {
        greedy: bool,
        min: usize,
        max: Option<usize>,
        inner: Box<Ast>,
    },
    Concat(Vec<Ast>),
    /// Ordered choice; the left arm has priority.
    Alternate(Box<Ast>, Box<Ast>),
    /// Match the text currently captured by the group; an unset or empty
    /// group matches the empty string.
    Backreference(usize),
}

// ---------------------------------------------------------------------------
// Built-in classes
// ---------------------------------------------------------------------------

/// `\d` — ASCII digits.
fn digit_ranges() -> Vec<CharRange> {
    vec![CharRange::new(0x30, 0x39)]
}

/// `\w` — ASCII word characters.
fn word_ranges() -> Vec<CharRange> {
    vec![
        CharRange::new(0x30, 0x39),
        CharRange::new(0x41, 0x5A),
        CharRange::new(0x5F, 0x5F),
        CharRange::new(0x61, 0x7A),
    ]
}

/// `\s` — the ECMAScript WhiteSpace and LineTerminator sets.
fn space_ranges() -> Vec<CharRange> {
    vec![
        CharRange::new(0x09, 0x0D),
        CharRange::new(0x20, 0x20),
        CharRange::new(0xA0, 0xA0),
        CharRange::new(0x1680, 0x1680),
        CharRange::new(0x2000, 0x200A),
        CharRange::new(0x2028, 0x2029),
        CharRange::new(0x202F, 0x202F),
        CharRange::new(0x205F, 0x205F),
        CharRange::new(0x3000, 0x3000),
        CharRange::new(0xFEFF, 0xFEFF),
    ]
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// The three pattern flags, all off by default.
///
/// `multiline` retargets `^`/`$` to line boundaries, `singleline` lets `.`
/// match `U+000A`, and `ignore_case` case-folds literals and bracketed
/// classes at parse time. Inline `(?flags:...)` groups override these for
/// the scope of the group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Flags {
    multiline: bool,
    singleline: bool,
    ignore_case: bool,
}

impl Flags {
    /// Parse the external flags string. `m`, `s`, and `i` are meaningful;
    /// any other character is ignored.
    fn parse(flags: &str) -> Flags {
        let mut out = Flags::default();
        for c in flags.chars() {
            match c {
                'm' => out.multiline = true,
                's' => out.singleline = true,
                'i' => out.ignore_case = true,
                _ => {}
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Everything the parser learns about a pattern.
#[derive(Debug)]
struct Parsed {
    ast: Ast,
    /// Total number of capture groups, including slot 0 (the whole match).
    group_count: usize,
    /// Named groups, name to index, in insertion order.
    names: IndexMap<String, usize>,
    /// Whether any backreference was parsed; switches the matcher into its
    /// non-deduplicating fallback.
    has_backreference: bool,
}

/// One atom inside a bracketed class: either a single code point (a
/// possible range endpoint) or a ready-made range list (`\d`, `\p{...}`).
enum ClassAtom {
    Single(u32),
    Ranges(Vec<CharRange>),
}

impl ClassAtom {
    fn single(&self) -> Option<u32> {
        match *self {
            ClassAtom::Single(cp) => Some(cp),
            ClassAtom::Ranges(_) => None,
        }
    }
}

/// Single-pass recursive-descent parser. No backtracking: every branch is
/// decided by at most two characters of lookahead.
struct Parser {
    chars: Vec<char>,
    pos: usize,
    flags: Flags,
    /// Next capture index to allocate; doubles as the running group count
    /// (index 0 is reserved for the whole match).
    group_count: usize,
    /// Capture indices opened but not yet closed, innermost last.
    open: Vec<usize>,
    names: IndexMap<String, usize>,
    has_backreference: bool,
}

impl Parser {
    fn new(pattern: &str, flags: Flags) -> Parser {
        Parser {
            chars: pattern.chars().collect(),
            pos: 0,
            flags,
            group_count: 1,
            open: Vec::new(),
            names: IndexMap::new(),
            has_backreference: false,
        }
    }

    // -- Cursor helpers ------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    /// Consume `c` if it is next.
    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    /// Build an error carrying the unconsumed tail as its fragment.
    fn error(&self, kind: ErrorKind) -> Error {
        Error {
            kind,
            fragment: self.chars[self.pos..].iter().collect(),
        }
    }

    // -- Grammar -------------------------------------------------------------

    fn parse(mut self) -> Result<Parsed, Error> {
        let ast = self.expression()?;
        if !self.at_end() {
            // expression() only stops early at `)`.
            return Err(self.error(ErrorKind::UnexpectedParenthesis));
        }
        debug_assert!(self.open.is_empty());
        Ok(Parsed {
            ast,
            group_count: self.group_count,
            names: self.names,
            has_backreference: self.has_backreference,
        })
    }

    /// `expression := sequence ('|' sequence)*`
    fn expression(&mut self) -> Result<Ast, Error> {
        let mut node = self.sequence()?;
        while self.eat('|') {
            let rhs = self.sequence()?;
            node = Ast::Alternate(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    /// `sequence := (factor quantifier?)*`, stopping at `|`, `)`, or the
    /// end of the pattern.
    fn sequence(&mut self) -> Result<Ast, Error> {
        let mut nodes = Vec::new();
        loop {
            match self.peek() {
                None | Some('|') | Some(')') => break,
                _ => {}
            }
            let factor = self.factor()?;
            nodes.push(self.quantifier(factor)?);
        }
        Ok(match nodes.len() {
            0 => Ast::Empty,
            1 => nodes.pop().ok_or_else(|| self.error(ErrorKind::InternalError))?,
            _ => Ast::Concat(nodes),
        })
    }

    /// Wrap `inner` in at most one quantifier. A trailing `?` flips the
    /// quantifier to lazy.
    fn quantifier(&mut self, inner: Ast) -> Result<Ast, Error> {
        let inner = Box::new(inner);
        Ok(match self.peek() {
            Some('*') => {
                self.bump();
                Ast::ZeroOrMore { greedy: self.greedy(), inner }
            }
            Some('+') => {
                self.bump();
                Ast::OneOrMore { greedy: self.greedy(), inner }
            }
            Some('?') => {
                self.bump();
                Ast::ZeroOrOne { greedy: self.greedy(), inner }
            }
            Some('{') => {
                self.bump();
                let (min, max) = self.repeat_bounds()?;
                Ast::Repeat { greedy: self.greedy(), min, max, inner }
            }
            _ => return Ok(*inner),
        })
    }

    fn greedy(&mut self) -> bool {
        !self.eat('?')
    }

    /// The `{n}`, `{n,}`, `{n,m}` body, after the opening `{`.
    fn repeat_bounds(&mut self) -> Result<(usize, Option<usize>), Error> {
        let min = match self.digits()? {
            Some(n) => n,
            None if self.peek() == Some('}') => {
                return Err(self.error(ErrorKind::MissingRepeatArgument));
            }
            None => return Err(self.error(ErrorKind::InvalidRepeatOp)),
        };
        let max = if self.eat(',') {
            if self.peek() == Some('}') {
                None
            } else {
                match self.digits()? {
                    Some(n) => Some(n),
                    None => return Err(self.error(ErrorKind::InvalidRepeatOp)),
                }
            }
        } else {
            Some(min)
        };
        if !self.eat('}') {
            // Covers `{n,m,...}` and an unterminated body alike.
            return Err(self.error(ErrorKind::InvalidRepeatOp));
        }
        if let Some(max) = max {
            if max < min {
                return Err(self.error(ErrorKind::InvalidRepeatSize));
            }
        }
        Ok((min, max))
    }

    /// Consume a run of ASCII digits. `Ok(None)` when none are present.
    fn digits(&mut self) -> Result<Option<usize>, Error> {
        let mut value: Option<usize> = None;
        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
            self.bump();
            let next = value
                .unwrap_or(0)
                .checked_mul(10)
                .and_then(|n| n.checked_add(d as usize));
            match next {
                Some(n) => value = Some(n),
                None => return Err(self.error(ErrorKind::InvalidRepeatSize)),
            }
        }
        Ok(value)
    }

    /// One unquantified unit: group, class, `.`, anchor, escape, or
    /// literal.
    fn factor(&mut self) -> Result<Ast, Error> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Err(self.error(ErrorKind::InternalError)),
        };
        match c {
            '(' => self.group(),
            '[' => self.char_class(),
            '.' => {
                self.bump();
                Ok(self.dot())
            }
            '^' => {
                self.bump();
                Ok(Ast::Assertion(if self.flags.multiline {
                    AssertionKind::BeginLine
                } else {
                    AssertionKind::BeginText
                }))
            }
            '$' => {
                self.bump();
                Ok(Ast::Assertion(if self.flags.multiline {
                    AssertionKind::EndLine
                } else {
                    AssertionKind::EndText
                }))
            }
            '\\' => self.escape(),
            '*' | '+' | '?' | '{' => Err(self.error(ErrorKind::MissingRepeatArgument)),
            ']' => Err(self.error(ErrorKind::MissingBracket)),
            _ => {
                self.bump();
                Ok(self.literal(c as u32))
            }
        }
    }

    /// `.` — any code point, minus `U+000A` unless `singleline`.
    fn dot(&self) -> Ast {
        if self.flags.singleline {
            Ast::Class {
                ranges: vec![CharRange::new(0, MAX_CODE_POINT)],
                negated: false,
            }
        } else {
            Ast::Class {
                ranges: vec![CharRange::single(0x0A)],
                negated: true,
            }
        }
    }

    /// A literal code point, case-folded when `ignore_case` is set.
    fn literal(&self, cp: u32) -> Ast {
        let single = vec![CharRange::single(cp)];
        let ranges = if self.flags.ignore_case {
            case_fold_expand(&single)
        } else {
            single
        };
        Ast::Class { ranges, negated: false }
    }

    // -- Groups --------------------------------------------------------------

    /// Everything after a `(`: capture, `(?:...)`, `(?<name>...)`, or a
    /// scoped flags group `(?flags-flags:...)`.
    fn group(&mut self) -> Result<Ast, Error> {
        self.bump(); // '('
        if !self.eat('?') {
            let index = self.open_group();
            let inner = self.expression()?;
            self.expect_close()?;
            self.close_group(index)?;
            return Ok(Ast::Capture { index, inner: Box::new(inner) });
        }
        if self.eat(':') {
            let inner = self.expression()?;
            self.expect_close()?;
            return Ok(inner);
        }
        if self.eat('<') {
            let name = self.capture_name()?;
            if self.names.contains_key(&name) {
                return Err(self.error(ErrorKind::InvalidNamedCapture));
            }
            let index = self.open_group();
            self.names.insert(name, index);
            let inner = self.expression()?;
            self.expect_close()?;
            self.close_group(index)?;
            return Ok(Ast::Capture { index, inner: Box::new(inner) });
        }

        // Scoped flags: `(?ims-ims:...)`. The saved flag set is restored
        // when the group closes.
        let saved = self.flags;
        let mut clearing = false;
        loop {
            match self.peek() {
                Some('i') => {
                    self.bump();
                    self.flags.ignore_case = !clearing;
                }
                Some('m') => {
                    self.bump();
                    self.flags.multiline = !clearing;
                }
                Some('s') => {
                    self.bump();
                    self.flags.singleline = !clearing;
                }
                Some('-') if !clearing => {
                    self.bump();
                    clearing = true;
                }
                Some(':') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.error(ErrorKind::UnexpectedParenthesis)),
            }
        }
        let inner = self.expression()?;
        self.expect_close()?;
        self.flags = saved;
        Ok(inner)
    }

    fn expect_close(&mut self) -> Result<(), Error> {
        if self.eat(')') {
            Ok(())
        } else {
            Err(self.error(ErrorKind::MissingParenthesis))
        }
    }

    /// Allocate the next capture index and mark it open.
    fn open_group(&mut self) -> usize {
        let index = self.group_count;
        self.group_count += 1;
        self.open.push(index);
        index
    }

    fn close_group(&mut self, index: usize) -> Result<(), Error> {
        // Groups close in strict LIFO order.
        if self.open.pop() != Some(index) {
            return Err(self.error(ErrorKind::InternalError));
        }
        Ok(())
    }

    /// The `name` of `(?<name>...)`, including the closing `>`. Names are
    /// `[A-Za-z_][A-Za-z0-9_]*`.
    fn capture_name(&mut self) -> Result<String, Error> {
        let mut name = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(ErrorKind::InvalidNamedCapture)),
                Some('>') => break,
                Some(c) => {
                    let ok = if name.is_empty() {
                        c == '_' || c.is_ascii_alphabetic()
                    } else {
                        c == '_' || c.is_ascii_alphanumeric()
                    };
                    if !ok {
                        return Err(self.error(ErrorKind::InvalidNamedCapture));
                    }
                    name.push(c);
                }
            }
        }
        if name.is_empty() {
            return Err(self.error(ErrorKind::InvalidNamedCapture));
        }
        Ok(name)
    }

    // -- Escapes -------------------------------------------------------------

    /// An escape outside a bracketed class.
    fn escape(&mut self) -> Result<Ast, Error> {
        self.bump(); // '\'
        let c = match self.bump() {
            Some(c) => c,
            None => return Err(self.error(ErrorKind::TrailingBackslash)),
        };
        match c {
            'd' => Ok(Ast::Class { ranges: digit_ranges(), negated: false }),
            'D' => Ok(Ast::Class { ranges: digit_ranges(), negated: true }),
            'w' => Ok(Ast::Class { ranges: word_ranges(), negated: false }),
            'W' => Ok(Ast::Class { ranges: word_ranges(), negated: true }),
            's' => Ok(Ast::Class { ranges: space_ranges(), negated: false }),
            'S' => Ok(Ast::Class { ranges: space_ranges(), negated: true }),
            't' => Ok(self.literal(0x09)),
            'n' => Ok(self.literal(0x0A)),
            'v' => Ok(self.literal(0x0B)),
            'f' => Ok(self.literal(0x0C)),
            'r' => Ok(self.literal(0x0D)),
            'b' => Ok(Ast::Assertion(AssertionKind::WordBoundary)),
            'B' => Ok(Ast::Assertion(AssertionKind::NoWordBoundary)),
            '0' => {
                if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    return Err(self.error(ErrorKind::InvalidEscape));
                }
                Ok(self.literal(0x00))
            }
            '1'..='9' => {
                let index = self.backreference_index(c)?;
                Ok(Ast::Backreference(index))
            }
            'k' => {
                let index = self.named_backreference()?;
                Ok(Ast::Backreference(index))
            }
            'p' => {
                let ranges = self.property_ranges()?;
                Ok(Ast::Class { ranges, negated: false })
            }
            'P' => {
                let ranges = self.property_ranges()?;
                Ok(Ast::Class { ranges, negated: true })
            }
            'u' => {
                let cp = self.unicode_escape()?;
                Ok(self.literal(cp))
            }
            'c' => Err(self.error(ErrorKind::InvalidEscape)),
            c if c.is_ascii_alphanumeric() => Err(self.error(ErrorKind::InvalidEscape)),
            c => Ok(self.literal(c as u32)),
        }
    }

    /// `\N...` — all following digits extend the group number.
    ///
    /// The group must already be closed: its index must be below the
    /// running counter and not on the open stack.
    fn backreference_index(&mut self, first: char) -> Result<usize, Error> {
        let mut index = first.to_digit(10).map(|d| d as usize).unwrap_or(0);
        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
            self.bump();
            index = match index.checked_mul(10).and_then(|n| n.checked_add(d as usize)) {
                Some(n) => n,
                None => return Err(self.error(ErrorKind::InvalidEscape)),
            };
        }
        self.check_backreference(index)
    }

    /// `\k<name>` — the name must already be bound by a closed group.
    fn named_backreference(&mut self) -> Result<usize, Error> {
        if !self.eat('<') {
            return Err(self.error(ErrorKind::InvalidEscape));
        }
        let mut name = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(ErrorKind::InvalidEscape)),
                Some('>') => break,
                Some(c) => name.push(c),
            }
        }
        let index = match self.names.get(&name) {
            Some(&index) => index,
            None => return Err(self.error(ErrorKind::InvalidEscape)),
        };
        self.check_backreference(index)
    }

    fn check_backreference(&mut self, index: usize) -> Result<usize, Error> {
        if index == 0 || index >= self.group_count || self.open.contains(&index) {
            return Err(self.error(ErrorKind::InvalidEscape));
        }
        self.has_backreference = true;
        Ok(index)
    }

    /// The `{Name}` of `\p{Name}` / `\P{Name}`, resolved through the alias
    /// table to a general-category range list.
    fn property_ranges(&mut self) -> Result<Vec<CharRange>, Error> {
        if !self.eat('{') {
            return Err(self.error(ErrorKind::InvalidCharClass));
        }
        let mut name = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(ErrorKind::InvalidCharClass)),
                Some('}') => break,
                Some(c) => name.push(c),
            }
        }
        match canonical_category(&name) {
            Some(canonical) => Ok(category_ranges(canonical)),
            None => Err(self.error(ErrorKind::InvalidCharClass)),
        }
    }

    /// `\u{H...H}` (one to six hex digits, at most `U+10FFFF`) or `\uHHHH`
    /// (exactly four).
    fn unicode_escape(&mut self) -> Result<u32, Error> {
        if self.eat('{') {
            let mut value: u32 = 0;
            let mut digits = 0;
            while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                self.bump();
                digits += 1;
                if digits > 6 {
                    return Err(self.error(ErrorKind::InvalidEscape));
                }
                value = value * 16 + d;
            }
            if digits == 0 || !self.eat('}') || value > MAX_CODE_POINT {
                return Err(self.error(ErrorKind::InvalidEscape));
            }
            Ok(value)
        } else {
            let mut value: u32 = 0;
            for _ in 0..4 {
                match self.bump().and_then(|c| c.to_digit(16)) {
                    Some(d) => value = value * 16 + d,
                    None => return Err(self.error(ErrorKind::InvalidEscape)),
                }
            }
            Ok(value)
        }
    }

    // -- Bracketed classes ---------------------------------------------------

    /// `[...]` after the opening bracket is peeked. `[]` is an empty class
    /// matching nothing; `[^]` matches any code point.
    fn char_class(&mut self) -> Result<Ast, Error> {
        self.bump(); // '['
        let negated = self.eat('^');
        let mut items: Vec<CharRange> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error(ErrorKind::MissingBracket)),
                Some(']') => {
                    self.bump();
                    break;
                }
                _ => {}
            }
            let atom = self.class_atom()?;
            // `a-b` only when `-` is followed by something other than the
            // closing bracket; a trailing `-` is a literal.
            if self.peek() == Some('-') && !matches!(self.peek_at(1), None | Some(']')) {
                self.bump(); // '-'
                let lo = match atom.single() {
                    Some(cp) => cp,
                    None => return Err(self.error(ErrorKind::InvalidCharClass)),
                };
                let hi = match self.class_atom()?.single() {
                    Some(cp) => cp,
                    None => return Err(self.error(ErrorKind::InvalidCharClass)),
                };
                if hi < lo {
                    return Err(self.error(ErrorKind::InvalidCharClass));
                }
                items.push(CharRange::new(lo, hi));
            } else {
                match atom {
                    ClassAtom::Single(cp) => items.push(CharRange::single(cp)),
                    ClassAtom::Ranges(ranges) => items.extend(ranges),
                }
            }
        }
        let mut ranges = simplify(&items);
        if self.flags.ignore_case {
            ranges = case_fold_expand(&ranges);
        }
        Ok(Ast::Class { ranges, negated })
    }

    fn class_atom(&mut self) -> Result<ClassAtom, Error> {
        match self.bump() {
            None => Err(self.error(ErrorKind::MissingBracket)),
            Some('\\') => self.class_escape(),
            Some(c) => Ok(ClassAtom::Single(c as u32)),
        }
    }

    /// An escape inside a bracketed class. `\b` is BACKSPACE here, and the
    /// backreference escapes (`\k`, digits) have no meaning.
    fn class_escape(&mut self) -> Result<ClassAtom, Error> {
        let c = match self.bump() {
            Some(c) => c,
            None => return Err(self.error(ErrorKind::TrailingBackslash)),
        };
        match c {
            'd' => Ok(ClassAtom::Ranges(digit_ranges())),
            'D' => Ok(ClassAtom::Ranges(complement(&digit_ranges()))),
            'w' => Ok(ClassAtom::Ranges(word_ranges())),
            'W' => Ok(ClassAtom::Ranges(complement(&word_ranges()))),
            's' => Ok(ClassAtom::Ranges(space_ranges())),
            'S' => Ok(ClassAtom::Ranges(complement(&space_ranges()))),
            't' => Ok(ClassAtom::Single(0x09)),
            'n' => Ok(ClassAtom::Single(0x0A)),
            'v' => Ok(ClassAtom::Single(0x0B)),
            'f' => Ok(ClassAtom::Single(0x0C)),
            'r' => Ok(ClassAtom::Single(0x0D)),
            'b' => Ok(ClassAtom::Single(0x08)),
            '0' => {
                if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    return Err(self.error(ErrorKind::InvalidEscape));
                }
                Ok(ClassAtom::Single(0x00))
            }
            'p' => Ok(ClassAtom::Ranges(self.property_ranges()?)),
            'P' => Ok(ClassAtom::Ranges(complement(&self.property_ranges()?))),
            'u' => Ok(ClassAtom::Single(self.unicode_escape()?)),
            'k' | 'c' => Err(self.error(ErrorKind::InvalidEscape)),
            c if c.is_ascii_alphanumeric() => Err(self.error(ErrorKind::InvalidEscape)),
            c => Ok(ClassAtom::Single(c as u32)),
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

use std::ops::Index;

/// Index into a program's instruction array.
///
/// [`InstIdx::NONE`] marks a branch target that has not been backpatched
/// yet; none survive in a finished [`Program`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct InstIdx(u32);

impl InstIdx {
    /// Sentinel for unpatched branch targets during compilation.
    const NONE: Self = Self(u32::MAX);

    /// First instruction of every program.
    const START: Self = Self(0);

    /// Return the raw index as `usize`. `NONE` must not be indexed.
    #[inline]
    fn idx(self) -> usize {
        debug_assert!(self != Self::NONE, "InstIdx::NONE used as index");
        self.0 as usize
    }

    /// The next instruction in straight-line order.
    #[inline]
    fn next(self) -> InstIdx {
        InstIdx(self.0 + 1)
    }
}

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `insts[inst_idx]` — typed access to the instruction array.
impl Index<InstIdx> for [Inst] {
    type Output = Inst;

    #[inline]
    fn index(&self, idx: InstIdx) -> &Inst {
        &self[idx.idx()]
    }
}

/// A normalized character-class table referenced by [`Inst::Char`].
type ClassRanges = Box<[CharRange]>;

/// Index into a program's class-table array ([`Program::classes`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ClassIdx(u32);

impl ClassIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// `classes[class_idx]` — typed access to the class tables.
impl Index<ClassIdx> for [ClassRanges] {
    type Output = ClassRanges;

    #[inline]
    fn index(&self, idx: ClassIdx) -> &ClassRanges {
        &self[idx.idx()]
    }
}

/// One VM instruction.
///
/// Zero-width instructions (`Save`, `Jump`, `Split`, `Assertion`, and
/// `Backreference` of an unset or empty group) are resolved inside
/// [`Matcher::addthread`]; `Char`, consuming `Backreference`, and `Matched`
/// are parked in the thread lists and handled by the step loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Inst {
    /// Accept; the thread's slots become the match.
    Matched,
    /// Record the current position in capture slot `slot`.
    Save { slot: usize },
    /// Consume one code point contained in the class, then fall through.
    Char { class: ClassIdx },
    /// Unconditional transfer.
    Jump { out: InstIdx },
    /// Fork; `out` is the higher-priority arm.
    Split { out: InstIdx, out1: InstIdx },
    /// Zero-width predicate; the thread dies if it fails.
    Assertion { kind: AssertionKind },
    /// Consume the text currently captured by `group`; unset or empty
    /// groups consume nothing.
    Backreference { group: usize },
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Lowers an [`Ast`] to a flat [`Program`].
///
/// Forward branch targets are emitted as [`InstIdx::NONE`] and backpatched
/// once the target position is known. Class tables are interned so that
/// repeated classes (`\d{4}` unrolls to four `Char`s) share one table.
#[derive(Debug, Default)]
struct Compiler {
    insts: Vec<Inst>,
    classes: IndexSet<ClassRanges>,
}

impl Compiler {
    /// Compile a parse result into a runnable program.
    fn compile(parsed: &Parsed) -> Program {
        let mut c = Compiler::default();

        // Scan-anywhere preamble: prefer opening the match at the current
        // position; otherwise consume one code point and loop. Body
        // threads therefore always outrank the scanning thread.
        let scan = c.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
        let any = c.intern_class(vec![CharRange::new(0, MAX_CODE_POINT)]);
        let advance = c.emit(Inst::Char { class: any });
        c.emit(Inst::Jump { out: scan });
        let body = c.emit(Inst::Save { slot: 0 });
        c.set_out(scan, body);
        c.set_out1(scan, advance);

        c.node(&parsed.ast);

        c.emit(Inst::Save { slot: 1 });
        c.emit(Inst::Matched);

        Program {
            insts: c.insts.into_boxed_slice(),
            classes: c.classes.into_iter().collect(),
            group_count: parsed.group_count,
            has_backreference: parsed.has_backreference,
        }
    }

    // -- Emission helpers ----------------------------------------------------

    /// Append an instruction and return its index.
    fn emit(&mut self, inst: Inst) -> InstIdx {
        let idx = InstIdx(self.insts.len() as u32);
        self.insts.push(inst);
        idx
    }

    /// The index the next emitted instruction will get.
    fn here(&self) -> InstIdx {
        InstIdx(self.insts.len() as u32)
    }

    /// Return the index of `ranges` in the class table, inserting it if
    /// not already present. Identical tables are deduplicated.
    fn intern_class(&mut self, ranges: Vec<CharRange>) -> ClassIdx {
        let (idx, _) = self.classes.insert_full(ranges.into_boxed_slice());
        ClassIdx(idx as u32)
    }

    /// Backpatch the preferred branch target of a `Jump` or `Split`.
    fn set_out(&mut self, at: InstIdx, to: InstIdx) {
        match &mut self.insts[at.idx()] {
            Inst::Jump { out } | Inst::Split { out, .. } => *out = to,
            inst => panic!("set_out: unexpected instruction {:?}", inst),
        }
    }

    /// Backpatch the lower-priority branch target of a `Split`.
    fn set_out1(&mut self, at: InstIdx, to: InstIdx) {
        match &mut self.insts[at.idx()] {
            Inst::Split { out1, .. } => *out1 = to,
            inst => panic!("set_out1: unexpected instruction {:?}", inst),
        }
    }

    // -- Per-node lowering ---------------------------------------------------

    fn node(&mut self, ast: &Ast) {
        match ast {
            Ast::Empty => {}
            Ast::Class { ranges, negated } => {
                let table = if *negated {
                    complement(ranges)
                } else {
                    simplify(ranges)
                };
                let class = self.intern_class(table);
                self.emit(Inst::Char { class });
            }
            Ast::Assertion(kind) => {
                self.emit(Inst::Assertion { kind: *kind });
            }
            Ast::Capture { index, inner } => {
                self.emit(Inst::Save { slot: 2 * index });
                self.node(inner);
                self.emit(Inst::Save { slot: 2 * index + 1 });
            }
            Ast::Alternate(left, right) => {
                let split = self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
                let lhs = self.here();
                self.node(left);
                let jump = self.emit(Inst::Jump { out: InstIdx::NONE });
                let rhs = self.here();
                self.node(right);
                let end = self.here();
                self.set_out(split, lhs);
                self.set_out1(split, rhs);
                self.set_out(jump, end);
            }
            Ast::ZeroOrMore { greedy, inner } => {
                self.zero_or_more(*greedy, inner);
            }
            Ast::OneOrMore { greedy, inner } => {
                let body = self.here();
                self.node(inner);
                let split = self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
                let exit = self.here();
                if *greedy {
                    self.set_out(split, body);
                    self.set_out1(split, exit);
                } else {
                    self.set_out(split, exit);
                    self.set_out1(split, body);
                }
            }
            Ast::ZeroOrOne { greedy, inner } => {
                let split = self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
                let body = self.here();
                self.node(inner);
                let exit = self.here();
                if *greedy {
                    self.set_out(split, body);
                    self.set_out1(split, exit);
                } else {
                    self.set_out(split, exit);
                    self.set_out1(split, body);
                }
            }
            Ast::Repeat { greedy, min, max, inner } => {
                // Mandatory copies first. Each copy re-compiles the body so
                // per-iteration capture slots behave like written-out
                // repetition.
                for _ in 0..*min {
                    self.node(inner);
                }
                match max {
                    Some(max) => {
                        // Optional copies, each behind its own split to the
                        // common exit.
                        let mut splits = Vec::with_capacity(max - min);
                        for _ in *min..*max {
                            let split =
                                self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
                            let body = self.here();
                            self.node(inner);
                            if *greedy {
                                self.set_out(split, body);
                            } else {
                                self.set_out1(split, body);
                            }
                            splits.push(split);
                        }
                        let exit = self.here();
                        for split in splits {
                            if *greedy {
                                self.set_out1(split, exit);
                            } else {
                                self.set_out(split, exit);
                            }
                        }
                    }
                    None => self.zero_or_more(*greedy, inner),
                }
            }
            Ast::Concat(nodes) => {
                for node in nodes {
                    self.node(node);
                }
            }
            Ast::Backreference(group) => {
                self.emit(Inst::Backreference { group: *group });
            }
        }
    }

    /// The `*` lowering: a split on each side of the body, both preferring
    /// the body when greedy. Using a second split (rather than a jump back
    /// to the first) lets an empty-matching body record its submatch once
    /// before the position dedup cuts the loop, so `(|a)*` captures the
    /// empty string rather than nothing.
    fn zero_or_more(&mut self, greedy: bool, inner: &Ast) {
        let head = self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
        let body = self.here();
        self.node(inner);
        let tail = self.emit(Inst::Split { out: InstIdx::NONE, out1: InstIdx::NONE });
        let exit = self.here();
        for split in [head, tail] {
            if greedy {
                self.set_out(split, body);
                self.set_out1(split, exit);
            } else {
                self.set_out(split, exit);
                self.set_out1(split, body);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled program
// ---------------------------------------------------------------------------

/// A compiled pattern, ready for matching. Immutable.
#[derive(Debug, PartialEq, Eq)]
pub struct Program {
    insts: Box<[Inst]>,
    /// Class tables referenced by [`Inst::Char`], deduplicated.
    classes: Box<[ClassRanges]>,
    /// Capture groups including slot 0; slot arrays are twice this long.
    group_count: usize,
    /// Switches the matcher into the per-step dedup fallback.
    has_backreference: bool,
}

impl Program {
    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Never true: every program carries at least the preamble, the
    /// whole-match saves, and `Matched`.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Total memory footprint (in bytes) of this compiled program,
    /// including both inline and heap-allocated data.
    ///
    /// Accounts for the `Program` struct itself, the instruction array,
    /// and the class tables (headers plus range storage).
    pub fn memory_size(&self) -> usize {
        let inline = mem::size_of::<Self>();
        let insts_alloc = self.insts.len() * mem::size_of::<Inst>();
        let classes_alloc = self.classes.len() * mem::size_of::<ClassRanges>()
            + self
                .classes
                .iter()
                .map(|table| table.len() * mem::size_of::<CharRange>())
                .sum::<usize>();
        inline + insts_alloc + classes_alloc
    }
}

/// Disassembly listing, one instruction per line.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, inst) in self.insts.iter().enumerate() {
            match inst {
                Inst::Matched => writeln!(f, "{:04} matched", i)?,
                Inst::Save { slot } => writeln!(f, "{:04} save {}", i, slot)?,
                Inst::Char { class } => {
                    write!(f, "{:04} char ", i)?;
                    write_ranges(f, &self.classes[*class])?;
                    writeln!(f)?;
                }
                Inst::Jump { out } => writeln!(f, "{:04} jump {}", i, out)?,
                Inst::Split { out, out1 } => writeln!(f, "{:04} split {}, {}", i, out, out1)?,
                Inst::Assertion { kind } => {
                    let name = match kind {
                        AssertionKind::BeginText => "begin-text",
                        AssertionKind::EndText => "end-text",
                        AssertionKind::BeginLine => "begin-line",
                        AssertionKind::EndLine => "end-line",
                        AssertionKind::WordBoundary => "word-boundary",
                        AssertionKind::NoWordBoundary => "no-word-boundary",
                    };
                    writeln!(f, "{:04} assert {}", i, name)?;
                }
                Inst::Backreference { group } => writeln!(f, "{:04} backref {}", i, group)?,
            }
        }
        Ok(())
    }
}

/// Render a range list as `61-7a,df` style hex, eliding nothing.
fn write_ranges(f: &mut fmt::Formatter<'_>, ranges: &[CharRange]) -> fmt::Result {
    for (i, range) in ranges.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        if range.start == range.end {
            write!(f, "{:x}", range.start)?;
        } else {
            write!(f, "{:x}-{:x}", range.start, range.end)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Matcher (Pike VM)
// ---------------------------------------------------------------------------

/// "Unrecorded" sentinel for capture slots, doubling as the "never seen"
/// stamp in `lastlist`. Works because real positions are bounded by the
/// input length.
const SLOT_UNSET: usize = usize::MAX;

/// One simulation state: an instruction, the input position it runs at,
/// and its capture slots.
///
/// `sp` is normally the cursor position, but a thread spawned by a
/// multi-byte backreference lands ahead of the cursor and sleeps in the
/// lists until the cursor reaches it.
#[derive(Clone, Debug)]
struct Thread {
    pc: InstIdx,
    sp: usize,
    slots: Rc<Vec<usize>>,
}

/// Runs one compiled program against one input.
///
/// All state here is call-local scratch: the generation array and both
/// thread lists are allocated once per [`run`](Matcher::run) and the list
/// allocations are recycled by swapping, never reallocated per step.
struct Matcher<'a> {
    program: &'a Program,
    input: &'a str,
    /// Per-instruction: the last position at which the instruction was
    /// added. O(1) thread dedup.
    lastlist: Vec<usize>,
    /// Threads live at the current position, priority order.
    clist: Vec<Thread>,
    /// Threads for the next position, built during a step.
    nlist: Vec<Thread>,
    /// Slots of the best accepting thread seen so far.
    matched: Option<Rc<Vec<usize>>>,
}

impl<'a> Matcher<'a> {
    fn new(program: &'a Program, input: &'a str) -> Matcher<'a> {
        Matcher {
            program,
            input,
            lastlist: vec![SLOT_UNSET; program.insts.len()],
            clist: Vec::with_capacity(program.insts.len()),
            nlist: Vec::with_capacity(program.insts.len()),
            matched: None,
        }
    }

    /// Drive the simulation over the whole input and return the winning
    /// capture slots, or an empty array if no thread accepted.
    fn run(mut self) -> Box<[usize]> {
        let slots = Rc::new(vec![SLOT_UNSET; 2 * self.program.group_count]);
        self.addthread(InstIdx::START, 0, slots);
        mem::swap(&mut self.clist, &mut self.nlist);

        let bytes = self.input.as_bytes();
        let mut pos = 0;
        while !self.clist.is_empty() {
            let current = self.input[pos..].chars().next();
            let width = current.map_or(0, char::len_utf8);

            // Capture contents are invisible to the dedup key, so programs
            // with backreferences may legitimately revisit a (pc, sp) pair
            // with different slots. Refill per step: dedup holds within a
            // position only.
            if self.program.has_backreference {
                self.lastlist.fill(SLOT_UNSET);
            }

            let mut clist = mem::take(&mut self.clist);
            for thread in clist.drain(..) {
                if thread.sp != pos {
                    // Sleeping past a multi-byte backreference; not
                    // runnable until the cursor catches up.
                    self.nlist.push(thread);
                    continue;
                }
                match self.program.insts[thread.pc] {
                    Inst::Char { class } => {
                        if let Some(c) = current {
                            if contains(&self.program.classes[class], c as u32) {
                                self.addthread(thread.pc.next(), pos + width, thread.slots);
                            }
                        }
                    }
                    Inst::Backreference { group } => {
                        // addthread only parks recorded, non-empty groups.
                        let start = thread.slots[2 * group];
                        let end = thread.slots[2 * group + 1];
                        let len = end - start;
                        if pos + len <= bytes.len()
                            && bytes[start..end] == bytes[pos..pos + len]
                        {
                            self.addthread(thread.pc.next(), pos + len, thread.slots);
                        }
                    }
                    Inst::Matched => {
                        // Leftmost-first: this thread outranks everything
                        // later in clist (including the scanning thread),
                        // so the remainder is dropped. Higher-priority
                        // successors already in nlist may still improve on
                        // it and overwrite.
                        self.matched = Some(thread.slots);
                        break;
                    }
                    // Zero-width instructions never park in the lists.
                    _ => {}
                }
            }
            self.clist = mem::replace(&mut self.nlist, clist);

            if pos >= bytes.len() {
                break;
            }
            pos += width;
        }

        match self.matched {
            Some(slots) => Rc::try_unwrap(slots)
                .unwrap_or_else(|shared| (*shared).clone())
                .into_boxed_slice(),
            None => Box::default(),
        }
    }

    /// Add the thread `(pc, sp, slots)` to `nlist`, resolving zero-width
    /// instructions in place: both arms of a split (preferred arm first,
    /// which is what encodes priority in list order), jumps, saves,
    /// assertions against `sp`, and backreferences of unset or empty
    /// groups. Consuming instructions and `Matched` are parked for the
    /// step loop.
    fn addthread(&mut self, pc: InstIdx, sp: usize, slots: Rc<Vec<usize>>) {
        // Backreference outcomes depend on the thread's slots, which the
        // (pc, position) key cannot distinguish, so those instructions are
        // never deduplicated. Every loop in a program contains a split,
        // which is deduplicated, so closure termination is unaffected.
        if !matches!(self.program.insts[pc], Inst::Backreference { .. }) {
            if self.lastlist[pc.idx()] == sp {
                return;
            }
            self.lastlist[pc.idx()] = sp;
        }

        match self.program.insts[pc] {
            Inst::Jump { out } => self.addthread(out, sp, slots),
            Inst::Split { out, out1 } => {
                self.addthread(out, sp, Rc::clone(&slots));
                self.addthread(out1, sp, slots);
            }
            Inst::Save { slot } => {
                // Copy-on-write: pay for a clone only when the array is
                // still shared with a higher-priority thread.
                let mut slots = slots;
                Rc::make_mut(&mut slots)[slot] = sp;
                self.addthread(pc.next(), sp, slots);
            }
            Inst::Assertion { kind } => {
                if self.assertion_holds(kind, sp) {
                    self.addthread(pc.next(), sp, slots);
                }
            }
            Inst::Backreference { group } => {
                let start = slots[2 * group];
                let end = slots[2 * group + 1];
                if start == SLOT_UNSET || end == SLOT_UNSET || start == end {
                    // Unrecorded or empty group: zero-width, resolve here.
                    self.addthread(pc.next(), sp, slots);
                } else {
                    self.nlist.push(Thread { pc, sp, slots });
                }
            }
            Inst::Char { .. } | Inst::Matched => {
                self.nlist.push(Thread { pc, sp, slots });
            }
        }
    }

    /// Evaluate a zero-width predicate at byte position `sp`.
    fn assertion_holds(&self, kind: AssertionKind, sp: usize) -> bool {
        let bytes = self.input.as_bytes();
        match kind {
            AssertionKind::BeginText => sp == 0,
            AssertionKind::EndText => sp == bytes.len(),
            AssertionKind::BeginLine => sp == 0 || bytes[sp - 1] == b'\n',
            AssertionKind::EndLine => sp == bytes.len() || bytes[sp] == b'\n',
            AssertionKind::WordBoundary | AssertionKind::NoWordBoundary => {
                // Out-of-range positions are non-word. A multi-byte code
                // point before `sp` ends in a continuation byte, which is
                // never a word byte, so the byte probe is exact.
                let before = sp > 0 && is_word_byte(bytes[sp - 1]);
                let after = sp < bytes.len() && is_word_byte(bytes[sp]);
                (before != after) == (kind == AssertionKind::WordBoundary)
            }
        }
    }
}

/// `[0-9A-Za-z_]`, the ASCII word characters used by `\b`/`\B`.
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// ---------------------------------------------------------------------------
// Regexp facade
// ---------------------------------------------------------------------------

/// A compiled regular expression.
///
/// Compiled once, matched any number of times; matching allocates only
/// call-local scratch, so a `Regexp` can be shared freely across threads.
#[derive(Debug)]
pub struct Regexp {
    program: Program,
    /// Named groups in insertion order.
    names: IndexMap<String, usize>,
}

impl Regexp {
    /// Compile `pattern` with no flags.
    pub fn new(pattern: &str) -> Result<Regexp, Error> {
        Regexp::compile(pattern, "")
    }

    /// Compile `pattern` with a flags string: any combination of `m`
    /// (multiline anchors), `s` (`.` matches `U+000A`), and `i`
    /// (case-insensitive). Unknown flag characters are ignored.
    pub fn compile(pattern: &str, flags: &str) -> Result<Regexp, Error> {
        Regexp::compile_with(pattern, Flags::parse(flags))
    }

    fn compile_with(pattern: &str, flags: Flags) -> Result<Regexp, Error> {
        let parsed = Parser::new(pattern, flags).parse()?;
        let program = Compiler::compile(&parsed);
        trace!(
            "compiled {:?}: {} instructions, {} classes, {} groups",
            pattern,
            program.insts.len(),
            program.classes.len(),
            program.group_count,
        );
        Ok(Regexp { program, names: parsed.names })
    }

    /// Run the pattern against `input`. Always returns a result;
    /// [`MatchResult::matched`] distinguishes the outcomes.
    pub fn execute<'t>(&self, input: &'t str) -> MatchResult<'_, 't> {
        let slots = Matcher::new(&self.program, input).run();
        trace!("executed against {} bytes: matched={}", input.len(), !slots.is_empty());
        MatchResult { regexp: self, input, slots }
    }

    /// Like [`execute`](Regexp::execute), but `None` when nothing matched.
    pub fn captures<'t>(&self, input: &'t str) -> Option<MatchResult<'_, 't>> {
        let result = self.execute(input);
        result.matched().then_some(result)
    }

    /// Total number of capture groups, including group 0 (the whole
    /// match).
    pub fn group_count(&self) -> usize {
        self.program.group_count
    }

    /// Names of the named groups, in the order they appear in the pattern.
    pub fn group_names(&self) -> Vec<&str> {
        self.names.keys().map(String::as_str).collect()
    }

    /// The group index bound to `name`, if any.
    pub fn group_by_name(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// The compiled program, for introspection ([`Program::memory_size`],
    /// the `Display` disassembly).
    pub fn program(&self) -> &Program {
        &self.program
    }
}

/// Builds a [`Regexp`] with programmatic flags instead of a flags string.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexpBuilder {
    flags: Flags,
}

impl RegexpBuilder {
    /// A builder with all flags off.
    pub fn new() -> RegexpBuilder {
        RegexpBuilder::default()
    }

    /// `^`/`$` match at line boundaries as well as text boundaries.
    pub fn multiline(mut self, yes: bool) -> RegexpBuilder {
        self.flags.multiline = yes;
        self
    }

    /// `.` also matches `U+000A`.
    pub fn singleline(mut self, yes: bool) -> RegexpBuilder {
        self.flags.singleline = yes;
        self
    }

    /// Case-insensitive matching via simple case folding.
    pub fn ignore_case(mut self, yes: bool) -> RegexpBuilder {
        self.flags.ignore_case = yes;
        self
    }

    /// Compile `pattern` with this builder's flags.
    pub fn compile(&self, pattern: &str) -> Result<Regexp, Error> {
        Regexp::compile_with(pattern, self.flags)
    }
}

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

/// The outcome of one [`Regexp::execute`] call. Immutable.
///
/// Borrows the regexp (for group names) and the input (all accessors
/// return subslices of it).
#[derive(Debug)]
pub struct MatchResult<'r, 't> {
    regexp: &'r Regexp,
    input: &'t str,
    /// `2 × group_count` byte offsets, or empty when nothing matched.
    slots: Box<[usize]>,
}

impl<'r, 't> MatchResult<'r, 't> {
    /// Whether the pattern matched at all.
    pub fn matched(&self) -> bool {
        !self.slots.is_empty()
    }

    /// The byte span of group `index`, or `None` when the group is out of
    /// range or did not capture on this match.
    pub fn span(&self, index: usize) -> Option<(usize, usize)> {
        let start = *self.slots.get(2 * index)?;
        let end = *self.slots.get(2 * index + 1)?;
        if start == SLOT_UNSET || end == SLOT_UNSET {
            return None;
        }
        Some((start, end))
    }

    /// The text of group `index`; group 0 is the whole match.
    pub fn get(&self, index: usize) -> Option<&'t str> {
        self.span(index).map(|(start, end)| &self.input[start..end])
    }

    /// Every group in index order, recorded or not; the length always
    /// equals [`Regexp::group_count`].
    pub fn results(&self) -> Vec<Option<&'t str>> {
        (0..self.regexp.group_count()).map(|i| self.get(i)).collect()
    }

    /// The named groups that captured on this match, in pattern order.
    pub fn groups(&self) -> IndexMap<&'r str, &'t str> {
        self.regexp
            .names
            .iter()
            .filter_map(|(name, &index)| self.get(index).map(|text| (name.as_str(), text)))
            .collect()
    }

    /// The input before the match, or the whole input when nothing
    /// matched.
    pub fn before(&self) -> &'t str {
        match self.span(0) {
            Some((start, _)) => &self.input[..start],
            None => self.input,
        }
    }

    /// The input after the match, or `""` when nothing matched.
    pub fn after(&self) -> &'t str {
        match self.span(0) {
            Some((_, end)) => &self.input[end..],
            None => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(pattern: &str) -> Parsed {
        Parser::new(pattern, Flags::default())
            .parse()
            .expect("pattern should parse")
    }

    fn parse_flags(pattern: &str, flags: &str) -> Parsed {
        Parser::new(pattern, Flags::parse(flags))
            .parse()
            .expect("pattern should parse")
    }

    fn parse_err(pattern: &str) -> ErrorKind {
        Parser::new(pattern, Flags::default())
            .parse()
            .expect_err("pattern should fail to parse")
            .kind()
    }

    /// A single-code-point literal node.
    fn lit(c: char) -> Ast {
        Ast::Class {
            ranges: vec![CharRange::single(c as u32)],
            negated: false,
        }
    }

    fn ranges(pairs: &[(u32, u32)]) -> Vec<CharRange> {
        pairs.iter().map(|&(s, e)| CharRange::new(s, e)).collect()
    }

    // -----------------------------------------------------------------------
    // Character-range utilities
    // -----------------------------------------------------------------------

    #[test]
    fn test_simplify_sorts_and_merges() {
        // Overlapping and adjacent ranges collapse; disjoint ones survive.
        let input = ranges(&[(30, 40), (5, 10), (11, 20), (35, 50)]);
        assert_eq!(simplify(&input), ranges(&[(5, 20), (30, 50)]));
    }

    #[test]
    fn test_simplify_adjacent_only() {
        assert_eq!(
            simplify(&ranges(&[(0, 4), (5, 10)])),
            ranges(&[(0, 10)]),
        );
        // One code point apart: not adjacent, stays split.
        assert_eq!(
            simplify(&ranges(&[(0, 3), (5, 10)])),
            ranges(&[(0, 3), (5, 10)]),
        );
    }

    #[test]
    fn test_simplify_empty_and_idempotent() {
        assert_eq!(simplify(&[]), vec![]);
        let once = simplify(&ranges(&[(7, 9), (0, 3), (4, 5)]));
        assert_eq!(simplify(&once), once);
    }

    #[test]
    fn test_simplify_preserves_membership() {
        let input = ranges(&[(10, 20), (15, 30), (32, 32), (33, 40)]);
        let output = simplify(&input);
        for cp in 0..64u32 {
            let direct = input.iter().any(|r| r.start <= cp && cp <= r.end);
            assert_eq!(contains(&output, cp), direct, "cp {}", cp);
        }
    }

    #[test]
    fn test_complement_empty_is_everything() {
        assert_eq!(complement(&[]), ranges(&[(0, MAX_CODE_POINT)]));
        assert_eq!(complement(&ranges(&[(0, MAX_CODE_POINT)])), vec![]);
    }

    #[test]
    fn test_complement_interior_and_edges() {
        assert_eq!(
            complement(&ranges(&[(10, 20), (30, 40)])),
            ranges(&[(0, 9), (21, 29), (41, MAX_CODE_POINT)]),
        );
        assert_eq!(
            complement(&ranges(&[(0, 9)])),
            ranges(&[(10, MAX_CODE_POINT)]),
        );
    }

    #[test]
    fn test_complement_involution() {
        let r = ranges(&[(3, 9), (11, 11), (40, 60)]);
        assert_eq!(complement(&complement(&r)), simplify(&r));
    }

    #[test]
    fn test_contains_edges() {
        let r = ranges(&[(10, 20), (30, 40)]);
        for cp in [10, 15, 20, 30, 40] {
            assert!(contains(&r, cp), "cp {}", cp);
        }
        for cp in [0, 9, 21, 29, 41, 1000] {
            assert!(!contains(&r, cp), "cp {}", cp);
        }
        assert!(!contains(&[], 0));
    }

    #[test]
    fn test_case_fold_expand_ascii_pair() {
        assert_eq!(
            case_fold_expand(&ranges(&[(0x61, 0x61)])),
            ranges(&[(0x41, 0x41), (0x61, 0x61)]),
        );
    }

    #[test]
    fn test_case_fold_expand_three_way_orbit() {
        // k, K, and KELVIN SIGN share one orbit.
        let expanded = case_fold_expand(&ranges(&[(0x6B, 0x6B)]));
        assert_eq!(
            expanded,
            ranges(&[(0x4B, 0x4B), (0x6B, 0x6B), (0x212A, 0x212A)]),
        );
    }

    #[test]
    fn test_case_fold_expand_range() {
        let expanded = case_fold_expand(&ranges(&[(0x61, 0x7A)]));
        // a-z pulls in A-Z plus the long-s and Kelvin orbit members.
        for cp in [0x41, 0x5A, 0x61, 0x7A, 0x17F, 0x212A] {
            assert!(contains(&expanded, cp), "cp {:#x}", cp);
        }
        assert!(!contains(&expanded, 0x30));
    }

    #[test]
    fn test_case_fold_expand_passthrough() {
        // No orbit members: ideographs and code points below MIN_FOLD.
        let cjk = ranges(&[(0x4E00, 0x4E10)]);
        assert_eq!(case_fold_expand(&cjk), cjk);
        let control = ranges(&[(0, 0x20)]);
        assert_eq!(case_fold_expand(&control), control);
    }

    // -----------------------------------------------------------------------
    // Unicode data
    // -----------------------------------------------------------------------

    #[test]
    fn test_canonical_category_names_and_aliases() {
        assert_eq!(canonical_category("Lu"), Some("Lu"));
        assert_eq!(canonical_category("L"), Some("L"));
        assert_eq!(canonical_category("Cn"), Some("Cn"));
        assert_eq!(canonical_category("Letter"), Some("L"));
        assert_eq!(canonical_category("digit"), Some("Nd"));
        assert_eq!(canonical_category("Decimal_Number"), Some("Nd"));
        assert_eq!(canonical_category("Bogus"), None);
        // Names are case-sensitive.
        assert_eq!(canonical_category("letter"), None);
    }

    #[test]
    fn test_category_letter_composite() {
        let letters = category_ranges("L");
        for c in ['A', 'z', 'É', 'σ', '世', 'あ'] {
            assert!(contains(&letters, c as u32), "{:?}", c);
        }
        for c in ['0', ' ', '!', '\n'] {
            assert!(!contains(&letters, c as u32), "{:?}", c);
        }
    }

    #[test]
    fn test_category_decimal_number() {
        let digits = category_ranges("Nd");
        assert!(contains(&digits, '7' as u32));
        // Fullwidth and Arabic-Indic digits.
        assert!(contains(&digits, 0xFF17));
        assert!(contains(&digits, 0x0663));
        assert!(!contains(&digits, 'x' as u32));
    }

    #[test]
    fn test_category_unassigned_is_complement() {
        let unassigned = category_ranges("Cn");
        assert!(contains(&unassigned, 0x0378));
        assert!(!contains(&unassigned, 'A' as u32));
        // C includes Cn.
        let other = category_ranges("C");
        assert!(contains(&other, 0x0378));
        assert!(contains(&other, 0x0000));
    }

    #[test]
    fn test_fold_orbits_close() {
        // Walking any orbit returns to its starting point.
        for start in [0x41u32, 0x6B, 0x53, 0x3A3, 0xDF] {
            let mut cp = fold_next(start);
            let mut steps = 1;
            while cp != start {
                cp = fold_next(cp);
                steps += 1;
                assert!(steps <= 4, "orbit of {:#x} too long", start);
            }
        }
        // One-element orbits map to themselves.
        assert_eq!(fold_next(0x30), 0x30);
        assert_eq!(fold_next(0x4E16), 0x4E16);
    }

    #[test]
    fn test_fold_orbit_sigma() {
        // Capital sigma, final sigma, small sigma.
        let mut orbit = vec![0x3A3u32];
        let mut cp = fold_next(0x3A3);
        while cp != 0x3A3 {
            orbit.push(cp);
            cp = fold_next(cp);
        }
        orbit.sort_unstable();
        assert_eq!(orbit, vec![0x3A3, 0x3C2, 0x3C3]);
    }

    // -----------------------------------------------------------------------
    // Parser: structure
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_empty_pattern() {
        let parsed = parse("");
        assert_eq!(parsed.ast, Ast::Empty);
        assert_eq!(parsed.group_count, 1);
        assert!(!parsed.has_backreference);
    }

    #[test]
    fn test_parse_literal_and_concat() {
        assert_eq!(parse("a").ast, lit('a'));
        assert_eq!(parse("ab").ast, Ast::Concat(vec![lit('a'), lit('b')]));
    }

    #[test]
    fn test_parse_alternation_left_folds() {
        assert_eq!(
            parse("a|b").ast,
            Ast::Alternate(Box::new(lit('a')), Box::new(lit('b'))),
        );
        assert_eq!(
            parse("a|b|c").ast,
            Ast::Alternate(
                Box::new(Ast::Alternate(Box::new(lit('a')), Box::new(lit('b')))),
                Box::new(lit('c')),
            ),
        );
        // Empty arms are legal.
        assert_eq!(
            parse("|a").ast,
            Ast::Alternate(Box::new(Ast::Empty), Box::new(lit('a'))),
        );
    }

    #[test]
    fn test_parse_quantifiers() {
        assert_eq!(
            parse("a*").ast,
            Ast::ZeroOrMore { greedy: true, inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a*?").ast,
            Ast::ZeroOrMore { greedy: false, inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a+").ast,
            Ast::OneOrMore { greedy: true, inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a??").ast,
            Ast::ZeroOrOne { greedy: false, inner: Box::new(lit('a')) },
        );
    }

    #[test]
    fn test_parse_repeat_bounds() {
        assert_eq!(
            parse("a{3}").ast,
            Ast::Repeat { greedy: true, min: 3, max: Some(3), inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a{3,}").ast,
            Ast::Repeat { greedy: true, min: 3, max: None, inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a{3,5}?").ast,
            Ast::Repeat { greedy: false, min: 3, max: Some(5), inner: Box::new(lit('a')) },
        );
        assert_eq!(
            parse("a{0}").ast,
            Ast::Repeat { greedy: true, min: 0, max: Some(0), inner: Box::new(lit('a')) },
        );
    }

    #[test]
    fn test_parse_dot_modes() {
        assert_eq!(
            parse(".").ast,
            Ast::Class { ranges: vec![CharRange::single(0x0A)], negated: true },
        );
        assert_eq!(
            parse_flags(".", "s").ast,
            Ast::Class { ranges: vec![CharRange::new(0, MAX_CODE_POINT)], negated: false },
        );
    }

    #[test]
    fn test_parse_anchor_modes() {
        assert_eq!(parse("^").ast, Ast::Assertion(AssertionKind::BeginText));
        assert_eq!(parse("$").ast, Ast::Assertion(AssertionKind::EndText));
        assert_eq!(parse_flags("^", "m").ast, Ast::Assertion(AssertionKind::BeginLine));
        assert_eq!(parse_flags("$", "m").ast, Ast::Assertion(AssertionKind::EndLine));
    }

    // -----------------------------------------------------------------------
    // Parser: escapes
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_control_escapes() {
        assert_eq!(parse(r"\t").ast, lit('\t'));
        assert_eq!(parse(r"\n").ast, lit('\n'));
        assert_eq!(parse(r"\v").ast, lit('\u{B}'));
        assert_eq!(parse(r"\f").ast, lit('\u{C}'));
        assert_eq!(parse(r"\r").ast, lit('\r'));
        assert_eq!(parse(r"\0").ast, lit('\0'));
    }

    #[test]
    fn test_parse_class_escapes() {
        assert_eq!(
            parse(r"\d").ast,
            Ast::Class { ranges: digit_ranges(), negated: false },
        );
        assert_eq!(
            parse(r"\W").ast,
            Ast::Class { ranges: word_ranges(), negated: true },
        );
        assert_eq!(
            parse(r"\s").ast,
            Ast::Class { ranges: space_ranges(), negated: false },
        );
    }

    #[test]
    fn test_parse_word_boundary_escapes() {
        assert_eq!(parse(r"\b").ast, Ast::Assertion(AssertionKind::WordBoundary));
        assert_eq!(parse(r"\B").ast, Ast::Assertion(AssertionKind::NoWordBoundary));
    }

    #[test]
    fn test_parse_escaped_metacharacters_are_literals() {
        for (pattern, c) in [
            (r"\.", '.'),
            (r"\*", '*'),
            (r"\(", '('),
            (r"\[", '['),
            (r"\{", '{'),
            (r"\|", '|'),
            (r"\\", '\\'),
            (r"\^", '^'),
            (r"\$", '$'),
            (r"\-", '-'),
        ] {
            assert_eq!(parse(pattern).ast, lit(c), "pattern {}", pattern);
        }
    }

    #[test]
    fn test_parse_unknown_alphanumeric_escape_is_error() {
        assert_eq!(parse_err(r"\q"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\A"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\c"), ErrorKind::InvalidEscape);
    }

    #[test]
    fn test_parse_nul_escape_digit_lookahead() {
        assert_eq!(parse(r"\0a").ast, Ast::Concat(vec![lit('\0'), lit('a')]));
        assert_eq!(parse_err(r"\01"), ErrorKind::InvalidEscape);
    }

    #[test]
    fn test_parse_unicode_escapes() {
        assert_eq!(parse(r"A").ast, lit('A'));
        assert_eq!(parse(r"\u{41}").ast, lit('A'));
        assert_eq!(parse(r"\u{1F600}").ast, lit('\u{1F600}'));
        assert_eq!(parse_err(r"\u"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\u12"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\u{}"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\u{110000}"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\u{1234567}"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\u{41"), ErrorKind::InvalidEscape);
    }

    #[test]
    fn test_parse_trailing_backslash() {
        assert_eq!(parse_err("\\"), ErrorKind::TrailingBackslash);
        assert_eq!(parse_err("ab\\"), ErrorKind::TrailingBackslash);
    }

    #[test]
    fn test_parse_property_classes() {
        let parsed = parse(r"\p{L}");
        match &parsed.ast {
            Ast::Class { ranges, negated } => {
                assert!(!negated);
                assert!(contains(ranges, 'A' as u32));
                assert!(!contains(ranges, '0' as u32));
            }
            other => panic!("unexpected ast {:?}", other),
        }
        match &parse(r"\P{Nd}").ast {
            Ast::Class { negated, .. } => assert!(negated),
            other => panic!("unexpected ast {:?}", other),
        }
        // Aliases resolve through the same table as the canonical names.
        assert_eq!(parse(r"\p{Letter}").ast, parse(r"\p{L}").ast);
    }

    #[test]
    fn test_parse_property_errors() {
        assert_eq!(parse_err(r"\p{Bogus}"), ErrorKind::InvalidCharClass);
        assert_eq!(parse_err(r"\pL"), ErrorKind::InvalidCharClass);
        assert_eq!(parse_err(r"\p{L"), ErrorKind::InvalidCharClass);
    }

    // -----------------------------------------------------------------------
    // Parser: bracketed classes
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_class_basic() {
        assert_eq!(
            parse("[a-c]").ast,
            Ast::Class { ranges: ranges(&[(0x61, 0x63)]), negated: false },
        );
        assert_eq!(
            parse("[^a]").ast,
            Ast::Class { ranges: ranges(&[(0x61, 0x61)]), negated: true },
        );
        // Members merge: b is adjacent to [a-c].
        assert_eq!(
            parse("[a-cb]").ast,
            Ast::Class { ranges: ranges(&[(0x61, 0x63)]), negated: false },
        );
    }

    #[test]
    fn test_parse_class_empty_forms() {
        assert_eq!(parse("[]").ast, Ast::Class { ranges: vec![], negated: false });
        assert_eq!(parse("[^]").ast, Ast::Class { ranges: vec![], negated: true });
        // Two empty classes, not one class containing `]` and `[`.
        assert_eq!(
            parse("[][]").ast,
            Ast::Concat(vec![
                Ast::Class { ranges: vec![], negated: false },
                Ast::Class { ranges: vec![], negated: false },
            ]),
        );
    }

    #[test]
    fn test_parse_class_dash_literals() {
        // Leading or trailing `-` is a literal.
        assert_eq!(
            parse("[-a]").ast,
            Ast::Class { ranges: ranges(&[(0x2D, 0x2D), (0x61, 0x61)]), negated: false },
        );
        assert_eq!(
            parse("[a-]").ast,
            Ast::Class { ranges: ranges(&[(0x2D, 0x2D), (0x61, 0x61)]), negated: false },
        );
        // Escaped `-` between atoms is a literal too.
        assert_eq!(
            parse(r"[a\-z]").ast,
            Ast::Class {
                ranges: ranges(&[(0x2D, 0x2D), (0x61, 0x61), (0x7A, 0x7A)]),
                negated: false,
            },
        );
    }

    #[test]
    fn test_parse_class_escape_endpoints() {
        assert_eq!(
            parse(r"[\t-\r]").ast,
            Ast::Class { ranges: ranges(&[(0x09, 0x0D)]), negated: false },
        );
        assert_eq!(
            parse(r"[A-\u{43}]").ast,
            Ast::Class { ranges: ranges(&[(0x41, 0x43)]), negated: false },
        );
    }

    #[test]
    fn test_parse_class_backspace_and_builtins() {
        assert_eq!(
            parse(r"[\b]").ast,
            Ast::Class { ranges: ranges(&[(0x08, 0x08)]), negated: false },
        );
        assert_eq!(
            parse(r"[\d]").ast,
            Ast::Class { ranges: digit_ranges(), negated: false },
        );
        // A negated builtin inside a class is complemented on the spot.
        assert_eq!(
            parse(r"[\D]").ast,
            Ast::Class { ranges: complement(&digit_ranges()), negated: false },
        );
    }

    #[test]
    fn test_parse_class_errors() {
        assert_eq!(parse_err("[z-a]"), ErrorKind::InvalidCharClass);
        assert_eq!(parse_err(r"[\d-x]"), ErrorKind::InvalidCharClass);
        assert_eq!(parse_err(r"[a-\d]"), ErrorKind::InvalidCharClass);
        assert_eq!(parse_err("[abc"), ErrorKind::MissingBracket);
        assert_eq!(parse_err("]"), ErrorKind::MissingBracket);
        assert_eq!(parse_err("a]b"), ErrorKind::MissingBracket);
        assert_eq!(parse_err(r"[\k]"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"[\c]"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"[\1]"), ErrorKind::InvalidEscape);
    }

    // -----------------------------------------------------------------------
    // Parser: groups, names, flags
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_group_numbering() {
        let parsed = parse("(a)(?<x>b)(?:c)(d)");
        assert_eq!(parsed.group_count, 4);
        assert_eq!(parsed.names.get("x"), Some(&2));
        match &parsed.ast {
            Ast::Concat(nodes) => {
                assert!(matches!(nodes[0], Ast::Capture { index: 1, .. }));
                assert!(matches!(nodes[1], Ast::Capture { index: 2, .. }));
                // (?:c) contributes no capture.
                assert_eq!(nodes[2], lit('c'));
                assert!(matches!(nodes[3], Ast::Capture { index: 3, .. }));
            }
            other => panic!("unexpected ast {:?}", other),
        }
    }

    #[test]
    fn test_parse_nested_group_numbering() {
        let parsed = parse("((a)(b))");
        assert_eq!(parsed.group_count, 4);
        match &parsed.ast {
            Ast::Capture { index: 1, inner } => match inner.as_ref() {
                Ast::Concat(nodes) => {
                    assert!(matches!(nodes[0], Ast::Capture { index: 2, .. }));
                    assert!(matches!(nodes[1], Ast::Capture { index: 3, .. }));
                }
                other => panic!("unexpected inner {:?}", other),
            },
            other => panic!("unexpected ast {:?}", other),
        }
    }

    #[test]
    fn test_parse_named_capture_errors() {
        assert_eq!(parse_err("(?<>a)"), ErrorKind::InvalidNamedCapture);
        assert_eq!(parse_err("(?<1a>b)"), ErrorKind::InvalidNamedCapture);
        assert_eq!(parse_err("(?<x y>b)"), ErrorKind::InvalidNamedCapture);
        assert_eq!(parse_err("(?<xa)"), ErrorKind::InvalidNamedCapture);
        assert_eq!(parse_err("(?<x>a)(?<x>b)"), ErrorKind::InvalidNamedCapture);
        // Lookbehind syntax is not a named group and not supported.
        assert_eq!(parse_err("(?<=a)b"), ErrorKind::InvalidNamedCapture);
    }

    #[test]
    fn test_parse_parenthesis_errors() {
        assert_eq!(parse_err("a(b"), ErrorKind::MissingParenthesis);
        assert_eq!(parse_err("(a"), ErrorKind::MissingParenthesis);
        assert_eq!(parse_err(")"), ErrorKind::UnexpectedParenthesis);
        assert_eq!(parse_err("a)b"), ErrorKind::UnexpectedParenthesis);
        assert_eq!(parse_err("(?x:a)"), ErrorKind::UnexpectedParenthesis);
        assert_eq!(parse_err("(?i)"), ErrorKind::UnexpectedParenthesis);
        assert_eq!(parse_err("(?)"), ErrorKind::UnexpectedParenthesis);
    }

    #[test]
    fn test_parse_quantifier_errors() {
        assert_eq!(parse_err("*a"), ErrorKind::MissingRepeatArgument);
        assert_eq!(parse_err("+"), ErrorKind::MissingRepeatArgument);
        assert_eq!(parse_err("a**"), ErrorKind::MissingRepeatArgument);
        assert_eq!(parse_err("a{}"), ErrorKind::MissingRepeatArgument);
        assert_eq!(parse_err("a{x}"), ErrorKind::InvalidRepeatOp);
        assert_eq!(parse_err("a{1,2,3}"), ErrorKind::InvalidRepeatOp);
        assert_eq!(parse_err("a{3"), ErrorKind::InvalidRepeatOp);
        assert_eq!(parse_err("a{,3}"), ErrorKind::InvalidRepeatOp);
        assert_eq!(parse_err("a{5,2}"), ErrorKind::InvalidRepeatSize);
    }

    #[test]
    fn test_parse_inline_flags_scope() {
        // Case folding applies inside the group only.
        match &parse("(?i:a)b").ast {
            Ast::Concat(nodes) => {
                match &nodes[0] {
                    Ast::Class { ranges, .. } => assert_eq!(ranges.len(), 2),
                    other => panic!("unexpected node {:?}", other),
                }
                assert_eq!(nodes[1], lit('b'));
            }
            other => panic!("unexpected ast {:?}", other),
        }
        // Clearing form wins over an outer flag.
        assert_eq!(parse_flags("(?-i:a)", "i").ast, lit('a'));
        // Combined set and clear forms parse.
        parse("(?im-s:a)");
        parse("(?-ims:a)");
    }

    #[test]
    fn test_parse_ignore_case_folds_at_parse_time() {
        match &parse_flags("k", "i").ast {
            Ast::Class { ranges, .. } => {
                assert!(contains(ranges, 0x4B));
                assert!(contains(ranges, 0x6B));
                assert!(contains(ranges, 0x212A));
            }
            other => panic!("unexpected ast {:?}", other),
        }
        match &parse_flags("[a-z]", "i").ast {
            Ast::Class { ranges, .. } => {
                assert!(contains(ranges, 0x41));
                assert!(contains(ranges, 0x7A));
            }
            other => panic!("unexpected ast {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Parser: backreferences
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_numeric_backreference() {
        let parsed = parse(r"(a)\1");
        assert!(parsed.has_backreference);
        match &parsed.ast {
            Ast::Concat(nodes) => assert_eq!(nodes[1], Ast::Backreference(1)),
            other => panic!("unexpected ast {:?}", other),
        }
        assert!(!parse("(a)b").has_backreference);
    }

    #[test]
    fn test_parse_multi_digit_backreference() {
        let parsed = parse(r"(a)(b)(c)(d)(e)(f)(g)(h)(i)(j)\10");
        assert_eq!(parsed.group_count, 11);
        assert!(parsed.has_backreference);
        match &parsed.ast {
            Ast::Concat(nodes) => {
                assert_eq!(nodes.last(), Some(&Ast::Backreference(10)));
            }
            other => panic!("unexpected ast {:?}", other),
        }
    }

    #[test]
    fn test_parse_backreference_scope_errors() {
        // Group does not exist (yet).
        assert_eq!(parse_err(r"\1"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\1(a)"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"(a)\2"), ErrorKind::InvalidEscape);
        // Group still open.
        assert_eq!(parse_err(r"(a\1)"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"(?<x>a\k<x>)"), ErrorKind::InvalidEscape);
    }

    #[test]
    fn test_parse_named_backreference() {
        let parsed = parse(r"(?<x>a)\k<x>");
        assert!(parsed.has_backreference);
        match &parsed.ast {
            Ast::Concat(nodes) => assert_eq!(nodes[1], Ast::Backreference(1)),
            other => panic!("unexpected ast {:?}", other),
        }
        assert_eq!(parse_err(r"\k<x>"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"\k"), ErrorKind::InvalidEscape);
        assert_eq!(parse_err(r"(?<x>a)\k<x"), ErrorKind::InvalidEscape);
    }

    #[test]
    fn test_parse_error_fragment_is_unconsumed_tail() {
        let err = Parser::new("ab{}cd", Flags::default())
            .parse()
            .expect_err("pattern should fail to parse");
        assert_eq!(err.kind(), ErrorKind::MissingRepeatArgument);
        assert_eq!(err.fragment(), "}cd");

        let err = Parser::new("*abc", Flags::default())
            .parse()
            .expect_err("pattern should fail to parse");
        assert_eq!(err.fragment(), "*abc");
    }

    #[test]
    fn test_error_display() {
        let err = Regexp::new("(a").unwrap_err();
        assert_eq!(err.to_string(), "missing parenthesis at end of pattern");
        let err = Regexp::new("a)b").unwrap_err();
        assert_eq!(err.to_string(), "unexpected parenthesis near `)b`");
    }

    // -----------------------------------------------------------------------
    // Compiler and program shape
    // -----------------------------------------------------------------------

    fn compile(pattern: &str) -> Regexp {
        Regexp::new(pattern).expect("pattern should compile")
    }

    #[test]
    fn test_compile_preamble_and_literals() {
        let re = compile("ab");
        let p = re.program();
        assert_eq!(p.insts.len(), 8);
        assert_eq!(p.insts[0], Inst::Split { out: InstIdx(3), out1: InstIdx(1) });
        assert_eq!(p.insts[1], Inst::Char { class: ClassIdx(0) });
        assert_eq!(p.insts[2], Inst::Jump { out: InstIdx(0) });
        assert_eq!(p.insts[3], Inst::Save { slot: 0 });
        assert_eq!(p.insts[4], Inst::Char { class: ClassIdx(1) });
        assert_eq!(p.insts[5], Inst::Char { class: ClassIdx(2) });
        assert_eq!(p.insts[6], Inst::Save { slot: 1 });
        assert_eq!(p.insts[7], Inst::Matched);
        // Class 0 is the preamble's any-code-point table.
        assert_eq!(&*p.classes[0], &[CharRange::new(0, MAX_CODE_POINT)][..]);
    }

    #[test]
    fn test_compile_alternation_layout() {
        let re = compile("a|b");
        let p = re.program();
        // 4: split, 5: char a, 6: jump end, 7: char b, 8: save 1.
        assert_eq!(p.insts[4], Inst::Split { out: InstIdx(5), out1: InstIdx(7) });
        assert!(matches!(p.insts[5], Inst::Char { .. }));
        assert_eq!(p.insts[6], Inst::Jump { out: InstIdx(8) });
        assert!(matches!(p.insts[7], Inst::Char { .. }));
        assert_eq!(p.insts[8], Inst::Save { slot: 1 });
    }

    #[test]
    fn test_compile_zero_or_more_uses_two_splits() {
        let re = compile("a*");
        let p = re.program();
        // 4: head split, 5: char a, 6: tail split, 7: save 1. Both splits
        // share the same body/exit targets.
        assert_eq!(p.insts[4], Inst::Split { out: InstIdx(5), out1: InstIdx(7) });
        assert_eq!(p.insts[6], Inst::Split { out: InstIdx(5), out1: InstIdx(7) });

        let lazy = compile("a*?");
        let p = lazy.program();
        assert_eq!(p.insts[4], Inst::Split { out: InstIdx(7), out1: InstIdx(5) });
        assert_eq!(p.insts[6], Inst::Split { out: InstIdx(7), out1: InstIdx(5) });
    }

    #[test]
    fn test_compile_one_or_more_layout() {
        let re = compile("a+");
        let p = re.program();
        assert!(matches!(p.insts[4], Inst::Char { .. }));
        assert_eq!(p.insts[5], Inst::Split { out: InstIdx(4), out1: InstIdx(6) });

        let lazy = compile("a+?");
        let p = lazy.program();
        assert_eq!(p.insts[5], Inst::Split { out: InstIdx(6), out1: InstIdx(4) });
    }

    #[test]
    fn test_compile_zero_or_one_layout() {
        let re = compile("a?");
        let p = re.program();
        assert_eq!(p.insts[4], Inst::Split { out: InstIdx(5), out1: InstIdx(6) });

        let lazy = compile("a??");
        let p = lazy.program();
        assert_eq!(p.insts[4], Inst::Split { out: InstIdx(6), out1: InstIdx(5) });
    }

    #[test]
    fn test_compile_bounded_repeat_unrolls() {
        let re = compile("a{2,4}");
        let p = re.program();
        // 4,5: mandatory copies; 6/8: splits guarding optional copies 7/9;
        // exit at 10.
        assert!(matches!(p.insts[4], Inst::Char { .. }));
        assert!(matches!(p.insts[5], Inst::Char { .. }));
        assert_eq!(p.insts[6], Inst::Split { out: InstIdx(7), out1: InstIdx(10) });
        assert_eq!(p.insts[8], Inst::Split { out: InstIdx(9), out1: InstIdx(10) });
        assert_eq!(p.insts[10], Inst::Save { slot: 1 });
    }

    #[test]
    fn test_compile_open_repeat_ends_in_star() {
        let re = compile("a{2,}");
        let p = re.program();
        assert!(matches!(p.insts[4], Inst::Char { .. }));
        assert!(matches!(p.insts[5], Inst::Char { .. }));
        assert_eq!(p.insts[6], Inst::Split { out: InstIdx(7), out1: InstIdx(9) });
        assert_eq!(p.insts[8], Inst::Split { out: InstIdx(7), out1: InstIdx(9) });
    }

    #[test]
    fn test_compile_repeat_recompiles_captures_per_copy() {
        let re = compile("(a){2}");
        let p = re.program();
        let saves = p
            .insts
            .iter()
            .filter(|inst| matches!(inst, Inst::Save { slot: 2 } | Inst::Save { slot: 3 }))
            .count();
        assert_eq!(saves, 4);
    }

    #[test]
    fn test_compile_negated_class_is_complemented() {
        let re = compile(".");
        let p = re.program();
        match p.insts[4] {
            Inst::Char { class } => {
                assert_eq!(
                    &*p.classes[class],
                    &[CharRange::new(0, 0x09), CharRange::new(0x0B, MAX_CODE_POINT)][..],
                );
            }
            inst => panic!("unexpected instruction {:?}", inst),
        }
    }

    #[test]
    fn test_compile_interns_identical_classes() {
        // Same class twice: one table.
        assert_eq!(compile("aa").program().classes.len(), 2);
        assert_eq!(compile("ab").program().classes.len(), 3);
        // Different spellings of the same set share one table.
        assert_eq!(compile(r"\d[0-9]").program().classes.len(), 2);
    }

    #[test]
    fn test_compile_memory_size_accounting() {
        // A second identical literal adds exactly one instruction, no
        // table.
        let one = compile("a");
        let two = compile("aa");
        assert_eq!(
            two.program().memory_size() - one.program().memory_size(),
            mem::size_of::<Inst>(),
        );
        // Identical sets, different spellings: same size.
        assert_eq!(
            compile(r"\d\d").program().memory_size(),
            compile(r"[0-9]\d").program().memory_size(),
        );
    }

    #[test]
    fn test_compile_twice_is_structurally_identical() {
        for pattern in ["a(bc|de)f", "(?<x>a+?)b{2,3}", r"[^a-z]\p{L}$"] {
            let first = Regexp::new(pattern).unwrap();
            let second = Regexp::new(pattern).unwrap();
            assert_eq!(first.program(), second.program(), "pattern {}", pattern);
        }
        assert_ne!(compile("a").program(), compile("b").program());
    }

    #[test]
    fn test_program_display_listing() {
        let listing = compile("ab").program().to_string();
        let expected = "\
0000 split 3, 1
0001 char 0-10ffff
0002 jump 0
0003 save 0
0004 char 61
0005 char 62
0006 save 1
0007 matched
";
        assert_eq!(listing, expected);
    }

    // -----------------------------------------------------------------------
    // Matching: literals, anchors, quantifiers
    // -----------------------------------------------------------------------

    fn exec_span(pattern: &str, flags: &str, input: &str) -> Option<(usize, usize)> {
        let re = Regexp::compile(pattern, flags).expect("pattern should compile");
        re.captures(input).and_then(|r| r.span(0))
    }

    #[test]
    fn test_match_literal_unanchored() {
        assert_eq!(exec_span("b", "", "ab"), Some((1, 2)));
        assert_eq!(exec_span("abc", "", "xxabcyy"), Some((2, 5)));
        assert_eq!(exec_span("abc", "", "xxabyy"), None);
    }

    #[test]
    fn test_match_empty_pattern() {
        assert_eq!(exec_span("", "", ""), Some((0, 0)));
        assert_eq!(exec_span("", "", "abc"), Some((0, 0)));
    }

    #[test]
    fn test_match_anchors() {
        assert_eq!(exec_span("^a", "", "ab"), Some((0, 1)));
        assert_eq!(exec_span("^b", "", "ab"), None);
        assert_eq!(exec_span("b$", "", "ab"), Some((1, 2)));
        assert_eq!(exec_span("a$", "", "ab"), None);
        assert_eq!(exec_span("^$", "", ""), Some((0, 0)));
        assert_eq!(exec_span("^$", "", "a"), None);
    }

    #[test]
    fn test_match_multiline_anchors() {
        // EndText does not treat a trailing newline as the end.
        assert_eq!(exec_span("o$", "", "o\n"), None);
        assert_eq!(exec_span("o$", "m", "o\n"), Some((0, 1)));
        assert_eq!(exec_span("^b", "", "a\nb"), None);
        assert_eq!(exec_span("^b", "m", "a\nb"), Some((2, 3)));
    }

    #[test]
    fn test_match_dot_and_newline() {
        assert_eq!(exec_span("a.b", "", "a\nb"), None);
        assert_eq!(exec_span("a.b", "s", "a\nb"), Some((0, 3)));
        assert_eq!(exec_span("a.b", "", "axb"), Some((0, 3)));
    }

    #[test]
    fn test_match_greedy_vs_lazy() {
        assert_eq!(exec_span("a+", "", "aaab"), Some((0, 3)));
        assert_eq!(exec_span("a+?", "", "aaab"), Some((0, 1)));
        assert_eq!(exec_span("a*", "", "aaab"), Some((0, 3)));
        assert_eq!(exec_span("a*?", "", "aaab"), Some((0, 0)));
        assert_eq!(exec_span("colou?r", "", "color"), Some((0, 5)));
        assert_eq!(exec_span("colou?r", "", "colour"), Some((0, 6)));
    }

    #[test]
    fn test_match_bounded_repeats() {
        assert_eq!(exec_span("a{2,4}", "", "aaaaaa"), Some((0, 4)));
        assert_eq!(exec_span("a{2,4}?", "", "aaaaaa"), Some((0, 2)));
        assert_eq!(exec_span("a{3}", "", "aa"), None);
        assert_eq!(exec_span("a{2,}", "", "aaaaa"), Some((0, 5)));
        assert_eq!(exec_span("a{0}b", "", "b"), Some((0, 1)));
        assert_eq!(exec_span("(ab){2,3}", "", "abababab"), Some((0, 6)));
        assert_eq!(exec_span("(ab){2,3}?", "", "abababab"), Some((0, 4)));
    }

    #[test]
    fn test_match_leftmost_first_alternation() {
        // The earlier arm wins even when a later arm would match more.
        assert_eq!(exec_span("a|ab", "", "ab"), Some((0, 1)));
        assert_eq!(exec_span("ab|a", "", "ab"), Some((0, 2)));
        // An earlier start beats a longer later match.
        assert_eq!(exec_span("ab|b", "", "xb"), Some((1, 2)));
    }

    #[test]
    fn test_match_word_boundaries() {
        assert_eq!(exec_span(r"\bfoo\b", "", "foo bar"), Some((0, 3)));
        assert_eq!(exec_span(r"\bfoo\b", "", "xfoo bar"), None);
        assert_eq!(exec_span(r"\bbar\b", "", "foo bar"), Some((4, 7)));
        assert_eq!(exec_span(r"\Bar\b", "", "bar"), Some((1, 3)));
        assert_eq!(exec_span(r"\bar\b", "", "bar"), None);
    }

    #[test]
    fn test_match_builtin_classes() {
        assert_eq!(exec_span(r"\d+", "", "abc123def"), Some((3, 6)));
        assert_eq!(exec_span(r"\w+", "", "  foo_1  "), Some((2, 7)));
        assert_eq!(exec_span(r"\s+", "", "ab\t \u{A0}cd"), Some((2, 6)));
        // ASCII classes: no fullwidth digits.
        assert_eq!(exec_span(r"\d", "", "\u{FF17}"), None);
        assert_eq!(exec_span(r"\D", "", "7a"), Some((1, 2)));
    }

    #[test]
    fn test_match_empty_classes() {
        // `[]` matches nothing at all.
        assert_eq!(exec_span("[]", "", "abc"), None);
        assert_eq!(exec_span("a[]b", "", "ab"), None);
        // `[^]` matches any code point, newline included.
        assert_eq!(exec_span("[^]", "", "\n"), Some((0, 1)));
        assert_eq!(exec_span("[^][^]", "", "a\u{1F600}"), Some((0, 5)));
    }

    #[test]
    fn test_match_linear_on_pathological_pattern() {
        // A backtracking engine would take 2^n steps on this; the thread
        // dedup keeps it linear.
        let input = "a".repeat(200);
        assert_eq!(exec_span("(a|a)*b", "", &input), None);
        let mut matching = input.clone();
        matching.push('b');
        assert_eq!(exec_span("(a|a)*b", "", &matching), Some((0, 201)));
    }

    // -----------------------------------------------------------------------
    // Matching: captures and priorities
    // -----------------------------------------------------------------------

    #[test]
    fn test_captures_basic_alternation() {
        let re = compile("a(bc|de)f");
        let r = re.execute("xxabcf");
        assert!(r.matched());
        assert_eq!(r.get(0), Some("abcf"));
        assert_eq!(r.get(1), Some("bc"));
        assert_eq!(r.span(0), Some((2, 6)));
        assert_eq!(r.before(), "xx");
        assert_eq!(r.after(), "");
    }

    #[test]
    fn test_captures_lazy_star_takes_empty() {
        let re = compile("(a*?)aaaa");
        let r = re.execute("aaaa");
        assert!(r.matched());
        assert_eq!(r.get(0), Some("aaaa"));
        assert_eq!(r.get(1), Some(""));
    }

    #[test]
    fn test_captures_lazy_plus_needs_one() {
        // `+?` still requires one pass through the body.
        assert!(!compile("(a+?)aaaa").execute("aaaa").matched());
        let re = compile("(a+?)aaa");
        let r = re.execute("aaaa");
        assert_eq!(r.get(0), Some("aaaa"));
        assert_eq!(r.get(1), Some("a"));
    }

    #[test]
    fn test_captures_named_date() {
        let re = compile(r"(?<year>\d{4})-(?<month>\d{2})-(?<day>\d{2})");
        let r = re.execute("2024-03-15");
        assert!(r.matched());
        let groups = r.groups();
        assert_eq!(groups.get("year"), Some(&"2024"));
        assert_eq!(groups.get("month"), Some(&"03"));
        assert_eq!(groups.get("day"), Some(&"15"));
    }

    #[test]
    fn test_captures_multiline_span() {
        assert_eq!(exec_span("^hello$", "", "hello world"), None);
        assert_eq!(exec_span("^hello$", "m", "hi\nhello\nok"), Some((3, 8)));
    }

    #[test]
    fn test_captures_last_iteration_wins() {
        let re = compile("(a|b)*");
        let r = re.execute("ab");
        assert_eq!(r.get(0), Some("ab"));
        assert_eq!(r.get(1), Some("b"));
    }

    #[test]
    fn test_captures_nested_spans_within_whole_match() {
        let re = compile("x((a)(b))y");
        let r = re.execute("zxaby");
        assert_eq!(r.span(0), Some((1, 5)));
        assert_eq!(r.span(1), Some((2, 4)));
        assert_eq!(r.span(2), Some((2, 3)));
        assert_eq!(r.span(3), Some((3, 4)));
        let (s0, e0) = r.span(0).unwrap();
        for i in 1..re.group_count() {
            let (s, e) = r.span(i).unwrap();
            assert!(s0 <= s && e <= e0);
        }
    }

    #[test]
    fn test_captures_unused_arm_is_unrecorded() {
        let re = compile("(a)|(b)");
        let r = re.execute("b");
        assert!(r.matched());
        assert_eq!(r.span(1), None);
        assert_eq!(r.get(1), None);
        assert_eq!(r.span(2), Some((0, 1)));
        assert_eq!(r.results(), vec![Some("b"), None, Some("b")]);
    }

    #[test]
    fn test_captures_empty_alternative_in_star() {
        // The empty arm records an empty submatch at position 0.
        let re = compile("(|a)*");
        let r = re.execute("aaa");
        assert_eq!(r.span(0), Some((0, 0)));
        assert_eq!(r.span(1), Some((0, 0)));

        let re = compile("(|a)+");
        let r = re.execute("aaa");
        assert_eq!(r.span(0), Some((0, 0)));
        assert_eq!(r.span(1), Some((0, 0)));
        let r = re.execute("");
        assert_eq!(r.span(0), Some((0, 0)));
        assert_eq!(r.span(1), Some((0, 0)));
    }

    #[test]
    fn test_before_after_partition_input() {
        for (pattern, input) in [
            ("bc", "abcd"),
            ("^", "abc"),
            ("$", "abc"),
            ("c+", "abcccd"),
            ("世", "x世y"),
        ] {
            let re = compile(pattern);
            let r = re.execute(input);
            assert!(r.matched(), "pattern {}", pattern);
            let rebuilt = format!("{}{}{}", r.before(), r.get(0).unwrap(), r.after());
            assert_eq!(rebuilt, input, "pattern {}", pattern);
        }
    }

    #[test]
    fn test_unmatched_result_shape() {
        let re = compile("(x)(y)");
        let r = re.execute("abc");
        assert!(!r.matched());
        assert_eq!(r.get(0), None);
        assert_eq!(r.span(1), None);
        assert_eq!(r.results(), vec![None, None, None]);
        assert!(r.groups().is_empty());
        assert_eq!(r.before(), "abc");
        assert_eq!(r.after(), "");
    }

    #[test]
    fn test_execute_and_captures_agree() {
        for (pattern, input) in [
            ("a+", "bbb"),
            ("a+", "baab"),
            ("^x", "yx"),
            ("", ""),
        ] {
            let re = compile(pattern);
            assert_eq!(
                re.execute(input).matched(),
                re.captures(input).is_some(),
                "pattern {}",
                pattern,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Matching: backreferences
    // -----------------------------------------------------------------------

    #[test]
    fn test_backreference_mirrored_pairs() {
        let re = compile(r"(.)(.)\2\1");
        let r = re.execute("abba");
        assert!(r.matched());
        assert_eq!(r.get(0), Some("abba"));
        assert_eq!(r.get(1), Some("a"));
        assert_eq!(r.get(2), Some("b"));
        assert!(!re.execute("abab").matched());
    }

    #[test]
    fn test_backreference_multi_byte_capture() {
        assert_eq!(exec_span(r"(ab)\1", "", "xabab"), Some((1, 5)));
        assert_eq!(exec_span(r"(ab)\1", "", "xabxb"), None);
        // The backreference consumes several positions at once; captures
        // after it still line up.
        let re = compile(r"(ab)\1(c)");
        let r = re.execute("ababc");
        assert_eq!(r.span(2), Some((4, 5)));
    }

    #[test]
    fn test_backreference_prefers_greedy_split() {
        let re = compile(r"(a+)\1");
        let r = re.execute("aaaa");
        assert_eq!(r.span(0), Some((0, 4)));
        assert_eq!(r.get(1), Some("aa"));
    }

    #[test]
    fn test_backreference_unset_group_is_empty() {
        // An unrecorded group backreference consumes nothing.
        assert_eq!(exec_span(r"(x)?y\1z", "", "yz"), Some((0, 2)));
        // So does an empty capture.
        assert_eq!(exec_span(r"()a\1", "", "a"), Some((0, 1)));
        assert_eq!(exec_span(r"(b*)a\1", "", "a"), Some((0, 1)));
    }

    #[test]
    fn test_backreference_named() {
        let re = compile(r"(?<d>\d)-\k<d>");
        assert!(re.execute("3-3").matched());
        assert!(!re.execute("3-4").matched());
    }

    #[test]
    fn test_backreference_comparison_is_exact() {
        // Backreference text comparison is raw code units, even under `i`:
        // the class matches either case but the copy must be identical.
        let re = Regexp::compile(r"(a)\1", "i").unwrap();
        assert!(re.execute("aa").matched());
        assert!(re.execute("AA").matched());
        assert!(!re.execute("aA").matched());
    }

    #[test]
    fn test_backreference_after_alternation() {
        // The zero-width resolution of an unset group must survive even
        // when a sibling arm parked the same backreference instruction.
        let re = compile(r"(?:(a)|a)\1");
        let r = re.execute("a");
        assert!(r.matched());
        assert_eq!(r.span(0), Some((0, 1)));
        let r = re.execute("aa");
        assert_eq!(r.span(0), Some((0, 2)));
        assert_eq!(r.get(1), Some("a"));
    }

    #[test]
    fn test_backreference_inside_star() {
        let re = compile(r"(a|b)(\1)*");
        let r = re.execute("aaab");
        assert_eq!(r.span(0), Some((0, 3)));
        assert_eq!(r.get(2), Some("a"));
    }

    // -----------------------------------------------------------------------
    // Matching: Unicode and case folding
    // -----------------------------------------------------------------------

    #[test]
    fn test_match_ignore_case_ascii() {
        let re = Regexp::compile("hello", "i").unwrap();
        let r = re.execute("HeLLo");
        assert_eq!(r.get(0), Some("HeLLo"));
    }

    #[test]
    fn test_match_ignore_case_orbits() {
        // Kelvin sign and the Greek sigmas fold across their whole orbits.
        let re = Regexp::compile("k", "i").unwrap();
        assert!(re.execute("\u{212A}").matched());
        let re = Regexp::compile("Σ", "i").unwrap();
        assert!(re.execute("σ").matched());
        assert!(re.execute("ς").matched());
        // A negated folded class excludes the whole orbit.
        let re = Regexp::compile("[^σ]", "i").unwrap();
        assert!(!re.execute("Σ").matched());
        assert!(re.execute("x").matched());
    }

    #[test]
    fn test_match_property_classes() {
        let re = compile(r"\p{Letter}+");
        let r = re.execute("Hello 世界");
        assert_eq!(r.get(0), Some("Hello"));
        let r = re.execute("世界");
        assert_eq!(r.get(0), Some("世界"));

        let re = compile(r"\p{Nd}+");
        assert_eq!(re.execute("x٣٤y").get(0), Some("٣٤"));

        let re = compile(r"\P{L}+");
        assert_eq!(re.execute("ab -- cd").get(0), Some(" -- "));
    }

    #[test]
    fn test_match_astral_code_points() {
        // One code point, four bytes.
        assert_eq!(exec_span(r"^.$", "", "𝄞"), Some((0, 4)));
        assert_eq!(exec_span(r"^..$", "", "𝄞a"), Some((0, 5)));
        assert_eq!(exec_span(r"\u{1D11E}", "", "a𝄞b"), Some((1, 5)));
        assert_eq!(exec_span("[𝄞-𝄢]", "", "𝄡"), Some((0, 4)));
    }

    #[test]
    fn test_match_surrogate_range_never_matches_input() {
        // A class over the surrogate gap compiles but cannot match any
        // well-formed input.
        let re = compile(r"[\u{D800}-\u{DFFF}]");
        assert!(!re.execute("a\u{10000}z").matched());
    }

    // -----------------------------------------------------------------------
    // Facade
    // -----------------------------------------------------------------------

    #[test]
    fn test_group_metadata() {
        let re = compile("(?<b>x)(y)(?<a>z)");
        assert_eq!(re.group_count(), 4);
        assert_eq!(re.group_names(), vec!["b", "a"]);
        assert_eq!(re.group_by_name("b"), Some(1));
        assert_eq!(re.group_by_name("a"), Some(3));
        assert_eq!(re.group_by_name("missing"), None);
    }

    #[test]
    fn test_group_by_name_agrees_with_get() {
        let re = compile("(?<first>a+)(?<second>b+)?");
        let r = re.execute("aaa");
        for name in re.group_names() {
            let index = re.group_by_name(name).unwrap();
            assert_eq!(r.groups().get(name).copied(), r.get(index), "group {}", name);
        }
    }

    #[test]
    fn test_groups_skips_unrecorded() {
        let re = compile("(?<a>x)|(?<b>y)");
        let groups = re.execute("y").groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.get("b"), Some(&"y"));
    }

    #[test]
    fn test_compile_error_scenarios() {
        assert_eq!(Regexp::new("a(b").unwrap_err().kind(), ErrorKind::MissingParenthesis);
        assert_eq!(Regexp::new("a{5,2}").unwrap_err().kind(), ErrorKind::InvalidRepeatSize);
    }

    #[test]
    fn test_flags_string_ignores_unknown() {
        let re = Regexp::compile("a", "ixq").unwrap();
        assert!(re.execute("A").matched());
    }

    #[test]
    fn test_builder_flags() {
        let re = RegexpBuilder::new()
            .ignore_case(true)
            .compile("abc")
            .unwrap();
        assert!(re.execute("xABCy").matched());

        let re = RegexpBuilder::new()
            .multiline(true)
            .singleline(true)
            .compile("^b.c$")
            .unwrap();
        assert!(re.execute("a\nb\nc\nd").matched());
    }

    #[test]
    fn test_regexp_shared_across_threads() {
        let re = compile("ab+c");
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..16 {
                        assert!(re.execute("xxabbbcyy").matched());
                        assert!(!re.execute("xxacyy").matched());
                    }
                });
            }
        });
    }

    // -----------------------------------------------------------------------
    // Cross-validation against the regex crate
    // -----------------------------------------------------------------------

    /// Assert that this engine and the `regex` crate agree on whether,
    /// and exactly where, `pattern` matches `input`, including every
    /// capture span.
    ///
    /// Only meaningful for patterns where the two dialects coincide: no
    /// `\d`/`\w`/`\s` (ASCII here, Unicode there), no `\b` (same), no
    /// backreferences (unsupported there), and no nested empty-matching
    /// repetition (documented divergence).
    fn assert_matches_oracle(pattern: &str, flags: &str, input: &str) {
        let oracle_pattern = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", flags, pattern)
        };
        let oracle = regex::Regex::new(&oracle_pattern).expect("oracle should parse pattern");
        let ours = Regexp::compile(pattern, flags).expect("pattern should compile");

        let expected: Option<Vec<Option<(usize, usize)>>> = oracle.captures(input).map(|caps| {
            (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect()
        });
        let actual: Option<Vec<Option<(usize, usize)>>> = ours
            .captures(input)
            .map(|r| (0..ours.group_count()).map(|i| r.span(i)).collect());
        assert_eq!(
            actual, expected,
            "span mismatch for `{}` (flags `{}`) on {:?}",
            pattern, flags, input,
        );
    }

    #[test]
    fn test_oracle_literals_and_classes() {
        for input in ["", "a", "ab", "xaby", "xy", "a\nb", "ab\nab"] {
            assert_matches_oracle("ab", "", input);
            assert_matches_oracle("[a-cx]+", "", input);
            assert_matches_oracle("[^ax]", "", input);
            assert_matches_oracle("a.b", "", input);
            assert_matches_oracle("a.b", "s", input);
        }
    }

    #[test]
    fn test_oracle_alternation_and_priority() {
        for input in ["ab", "ba", "aab", "b", "", "abab"] {
            assert_matches_oracle("a|ab", "", input);
            assert_matches_oracle("ab|a", "", input);
            assert_matches_oracle("(a|ab)(b|)", "", input);
        }
    }

    #[test]
    fn test_oracle_quantifiers_and_captures() {
        for input in ["", "a", "aa", "aaaa", "aaab", "baaa"] {
            assert_matches_oracle("(a*)(a*)", "", input);
            assert_matches_oracle("(a+?)(a*)", "", input);
            assert_matches_oracle("(a{2,3})a", "", input);
            assert_matches_oracle("a{2,}", "", input);
            assert_matches_oracle("(a?)(a??)(a?)", "", input);
        }
    }

    #[test]
    fn test_oracle_anchors_and_multiline() {
        for input in ["x", "a\nx\nb", "x\n", "\nx", "ax\nxa"] {
            assert_matches_oracle("^x", "", input);
            assert_matches_oracle("x$", "", input);
            assert_matches_oracle("^x$", "m", input);
            assert_matches_oracle("^", "m", input);
        }
    }

    #[test]
    fn test_oracle_named_groups() {
        for input in ["aabb", "ab", "ba", "aab"] {
            assert_matches_oracle("(?<head>a+)(?<tail>b+)", "", input);
            assert_matches_oracle("(?:a(?<x>b))+", "", input);
        }
    }

    #[test]
    fn test_oracle_case_folding() {
        for input in ["abc", "ABC", "aBc", "\u{212A}", "σ", "Σ", "ς"] {
            assert_matches_oracle("abc", "i", input);
            assert_matches_oracle("k", "i", input);
            assert_matches_oracle("σ", "i", input);
            assert_matches_oracle("[a-c]+", "i", input);
        }
    }

    #[test]
    fn test_oracle_repetition_combinations() {
        use itertools::Itertools;

        let pattern = "^(a|bc){1,2}$";
        // Every arrangement of the arms, one through three repetitions;
        // three must not match.
        for count in 1..=3 {
            for combo in std::iter::repeat_n(["a", "bc"], count)
                .map(|arms| arms.into_iter())
                .multi_cartesian_product()
            {
                let input = combo.into_iter().collect::<String>();
                assert_matches_oracle(pattern, "", &input);
            }
        }
        assert_matches_oracle(pattern, "", "");
        assert_matches_oracle(pattern, "", "b");
        assert_matches_oracle(pattern, "", "ca");
    }

    #[test]
    fn test_oracle_astral_input() {
        for input in ["𝄞", "a𝄞b", "𝄞𝄡", ""] {
            assert_matches_oracle("(.)(.?)", "", input);
            assert_matches_oracle("𝄞", "", input);
        }
    }
}
