//! Regular expression parsing and Thompson NFA construction
//!
//! Supports the small regex dialect used to describe training languages:
//! literals, grouping, alternation (including empty alternatives), and the
//! postfix operators `*`, `+` and `?`. A backslash escapes the next byte.

use anyhow::{bail, Result};
use std::collections::BTreeSet;

/// Parsed regular expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regex {
    /// Matches the empty word
    Empty,
    /// Matches a single byte
    Literal(u8),
    Concat(Vec<Regex>),
    Alternation(Vec<Regex>),
    Star(Box<Regex>),
    Plus(Box<Regex>),
    Optional(Box<Regex>),
}

impl Regex {
    /// Parse a pattern into an AST
    pub fn parse(pattern: &str) -> Result<Self> {
        Parser::new(pattern)?.parse()
    }

    /// Sorted set of literal bytes appearing in the expression
    pub fn alphabet(&self) -> BTreeSet<u8> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, out: &mut BTreeSet<u8>) {
        match self {
            Regex::Empty => {}
            Regex::Literal(b) => {
                out.insert(*b);
            }
            Regex::Concat(items) | Regex::Alternation(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
            Regex::Star(inner) | Regex::Plus(inner) | Regex::Optional(inner) => {
                inner.collect_symbols(out);
            }
        }
    }
}

fn is_meta(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'|' | b'*' | b'+' | b'?' | b'\\')
}

/// Recursive-descent parser
///
/// ```text
/// alt    := concat ('|' concat)*
/// concat := repeat*
/// repeat := atom ('*' | '+' | '?')*
/// atom   := literal | '\' byte | '(' alt ')'
/// ```
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(pattern: &'a str) -> Result<Self> {
        if let Some(offset) = pattern.bytes().position(|b| !(b.is_ascii_graphic() || b == b' ')) {
            bail!("Unsupported byte in regex at offset {offset}: only printable ASCII is allowed");
        }
        Ok(Self {
            input: pattern.as_bytes(),
            pos: 0,
        })
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Regex> {
        let regex = self.parse_alternation()?;
        if let Some(b) = self.peek() {
            bail!(
                "Unexpected '{}' at offset {} (unbalanced parenthesis?)",
                b as char,
                self.pos
            );
        }
        Ok(regex)
    }

    fn parse_alternation(&mut self) -> Result<Regex> {
        let mut branches = vec![self.parse_concat()?];
        while self.peek() == Some(b'|') {
            self.pos += 1;
            branches.push(self.parse_concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Regex::Alternation(branches)
        })
    }

    fn parse_concat(&mut self) -> Result<Regex> {
        let mut items = Vec::new();
        while let Some(b) = self.peek() {
            if b == b'|' || b == b')' {
                break;
            }
            items.push(self.parse_repeat()?);
        }
        Ok(match items.len() {
            0 => Regex::Empty,
            1 => items.remove(0),
            _ => Regex::Concat(items),
        })
    }

    fn parse_repeat(&mut self) -> Result<Regex> {
        let mut atom = self.parse_atom()?;
        while let Some(op) = self.peek() {
            atom = match op {
                b'*' => Regex::Star(Box::new(atom)),
                b'+' => Regex::Plus(Box::new(atom)),
                b'?' => Regex::Optional(Box::new(atom)),
                _ => break,
            };
            self.pos += 1;
        }
        Ok(atom)
    }

    fn parse_atom(&mut self) -> Result<Regex> {
        let start = self.pos;
        let Some(b) = self.peek() else {
            bail!("Unexpected end of regex at offset {start}");
        };
        self.pos += 1;
        match b {
            b'(' => {
                let inner = self.parse_alternation()?;
                if self.peek() != Some(b')') {
                    bail!("Unclosed '(' opened at offset {start}");
                }
                self.pos += 1;
                Ok(inner)
            }
            b'\\' => {
                let Some(escaped) = self.peek() else {
                    bail!("Dangling escape at offset {start}");
                };
                self.pos += 1;
                Ok(Regex::Literal(escaped))
            }
            b'*' | b'+' | b'?' => {
                bail!("Operator '{}' at offset {start} has nothing to repeat", b as char)
            }
            _ if is_meta(b) => bail!("Unexpected '{}' at offset {start}", b as char),
            _ => Ok(Regex::Literal(b)),
        }
    }
}

/// A single NFA state: epsilon edges plus labelled edges
#[derive(Debug, Clone, Default)]
pub struct NfaState {
    pub epsilon: Vec<usize>,
    pub edges: Vec<(u8, usize)>,
}

/// Thompson-construction NFA with one start and one accepting state
#[derive(Debug, Clone)]
pub struct Nfa {
    pub states: Vec<NfaState>,
    pub start: usize,
    pub accept: usize,
}

impl Nfa {
    /// Build an NFA from a parsed expression
    pub fn from_regex(regex: &Regex) -> Self {
        let mut builder = NfaBuilder { states: Vec::new() };
        let (start, accept) = builder.build(regex);
        Self {
            states: builder.states,
            start,
            accept,
        }
    }

    /// Epsilon closure of a set of states
    pub fn closure(&self, seeds: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        let mut stack: Vec<usize> = seeds.into_iter().collect();
        while let Some(s) = stack.pop() {
            if set.insert(s) {
                stack.extend(self.states[s].epsilon.iter().copied());
            }
        }
        set
    }

    /// States reachable from `set` by consuming `symbol`, before closure
    pub fn step(&self, set: &BTreeSet<usize>, symbol: u8) -> Vec<usize> {
        set.iter()
            .flat_map(|&s| {
                self.states[s]
                    .edges
                    .iter()
                    .filter(move |(b, _)| *b == symbol)
                    .map(|&(_, to)| to)
            })
            .collect()
    }
}

struct NfaBuilder {
    states: Vec<NfaState>,
}

impl NfaBuilder {
    fn add(&mut self) -> usize {
        self.states.push(NfaState::default());
        self.states.len() - 1
    }

    fn eps(&mut self, from: usize, to: usize) {
        self.states[from].epsilon.push(to);
    }

    /// Returns the (entry, exit) pair of the fragment
    fn build(&mut self, regex: &Regex) -> (usize, usize) {
        match regex {
            Regex::Empty => {
                let s = self.add();
                let e = self.add();
                self.eps(s, e);
                (s, e)
            }
            Regex::Literal(b) => {
                let s = self.add();
                let e = self.add();
                self.states[s].edges.push((*b, e));
                (s, e)
            }
            Regex::Concat(items) if items.is_empty() => self.build(&Regex::Empty),
            Regex::Concat(items) => {
                let mut fragments = items.iter().map(|item| self.build(item)).collect::<Vec<_>>();
                let (entry, mut exit) = fragments.remove(0);
                for (s, e) in fragments {
                    self.eps(exit, s);
                    exit = e;
                }
                (entry, exit)
            }
            Regex::Alternation(branches) => {
                let s = self.add();
                let e = self.add();
                for branch in branches {
                    let (bs, be) = self.build(branch);
                    self.eps(s, bs);
                    self.eps(be, e);
                }
                (s, e)
            }
            Regex::Star(inner) => {
                let s = self.add();
                let e = self.add();
                let (is, ie) = self.build(inner);
                self.eps(s, is);
                self.eps(s, e);
                self.eps(ie, is);
                self.eps(ie, e);
                (s, e)
            }
            Regex::Plus(inner) => {
                let s = self.add();
                let e = self.add();
                let (is, ie) = self.build(inner);
                self.eps(s, is);
                self.eps(ie, is);
                self.eps(ie, e);
                (s, e)
            }
            Regex::Optional(inner) => {
                let s = self.add();
                let e = self.add();
                let (is, ie) = self.build(inner);
                self.eps(s, is);
                self.eps(s, e);
                self.eps(ie, e);
                (s, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nfa_accepts(nfa: &Nfa, word: &[u8]) -> bool {
        let mut current = nfa.closure([nfa.start]);
        for &b in word {
            current = nfa.closure(nfa.step(&current, b));
        }
        current.contains(&nfa.accept)
    }

    #[test]
    fn test_parse_parity_pattern() {
        let regex = Regex::parse("((B|C)*AB*A)*(B|C)*").unwrap();
        let alphabet: Vec<u8> = regex.alphabet().into_iter().collect();
        assert_eq!(alphabet, vec![b'A', b'B', b'C']);
    }

    #[test]
    fn test_parse_precedence() {
        // Concatenation binds tighter than alternation, postfix tighter than both
        let regex = Regex::parse("AB*|C").unwrap();
        assert_eq!(
            regex,
            Regex::Alternation(vec![
                Regex::Concat(vec![
                    Regex::Literal(b'A'),
                    Regex::Star(Box::new(Regex::Literal(b'B')))
                ]),
                Regex::Literal(b'C'),
            ])
        );
    }

    #[test]
    fn test_parse_empty_alternative() {
        let regex = Regex::parse("(A|)").unwrap();
        assert_eq!(
            regex,
            Regex::Alternation(vec![Regex::Literal(b'A'), Regex::Empty])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Regex::parse("(AB").is_err());
        assert!(Regex::parse("AB)").is_err());
        assert!(Regex::parse("*A").is_err());
        assert!(Regex::parse("A\\").is_err());
        assert!(Regex::parse("Aé").is_err());
    }

    #[test]
    fn test_escape() {
        let regex = Regex::parse("\\*A").unwrap();
        assert_eq!(
            regex,
            Regex::Concat(vec![Regex::Literal(b'*'), Regex::Literal(b'A')])
        );
    }

    #[test]
    fn test_nfa_matching() {
        let nfa = Nfa::from_regex(&Regex::parse("((B|C)*AB*A)*(B|C)*").unwrap());
        assert!(nfa_accepts(&nfa, b""));
        assert!(nfa_accepts(&nfa, b"AA"));
        assert!(nfa_accepts(&nfa, b"CABAB"));
        assert!(!nfa_accepts(&nfa, b"A"));
        assert!(!nfa_accepts(&nfa, b"ACA"));
    }

    #[test]
    fn test_nfa_plus_and_optional() {
        let nfa = Nfa::from_regex(&Regex::parse("A+B?").unwrap());
        assert!(nfa_accepts(&nfa, b"A"));
        assert!(nfa_accepts(&nfa, b"AAB"));
        assert!(!nfa_accepts(&nfa, b"B"));
        assert!(!nfa_accepts(&nfa, b"ABB"));
    }
}
