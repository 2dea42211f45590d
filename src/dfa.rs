//! Minimal deterministic finite automata compiled from regular expressions
//!
//! Compilation runs subset construction over the Thompson NFA, then Moore
//! partition refinement, then renumbers the states so that:
//!
//! - state `0` is the dead (rejecting sink) state
//! - the start state is `1` (unless the language is empty)
//! - the remaining live states follow in breadth-first order, exploring
//!   symbols in ascending byte order
//!
//! For the parity language `((B|C)*AB*A)*(B|C)*` this yields live states
//! `{1 = even, 2 = odd}`, which is what the probing stage relies on.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;

use crate::regex::{Nfa, Regex};

/// Index of the rejecting sink state
pub const DEAD_STATE: usize = 0;

/// A complete, minimal DFA over a byte alphabet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dfa {
    alphabet: Vec<u8>,
    /// `transitions[state][symbol_index]`
    transitions: Vec<Vec<usize>>,
    accepting: Vec<bool>,
    start: usize,
    pattern: String,
}

impl Dfa {
    /// Compile a regular expression into a minimal DFA
    pub fn from_regex(pattern: &str) -> Result<Self> {
        let regex = Regex::parse(pattern).with_context(|| format!("Invalid regex '{pattern}'"))?;
        let alphabet: Vec<u8> = regex.alphabet().into_iter().collect();
        let nfa = Nfa::from_regex(&regex);

        let raw = subset_construction(&nfa, &alphabet);
        let minimal = minimize(&raw);
        let mut dfa = renumber(&minimal);
        dfa.alphabet = alphabet;
        dfa.pattern = pattern.to_string();
        Ok(dfa)
    }

    /// Source pattern this automaton was compiled from
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Sorted input alphabet
    pub fn alphabet(&self) -> &[u8] {
        &self.alphabet
    }

    /// Number of states, including the dead state
    pub fn n_states(&self) -> usize {
        self.transitions.len()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn is_accepting(&self, state: usize) -> bool {
        self.accepting.get(state).copied().unwrap_or(false)
    }

    /// Live states, i.e. every state except the dead state
    pub fn live_states(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_states()).filter(|&s| s != DEAD_STATE)
    }

    /// Transition on one byte; bytes outside the alphabet lead to the dead state
    pub fn step(&self, state: usize, symbol: u8) -> usize {
        match self.alphabet.binary_search(&symbol) {
            Ok(idx) => self.transitions[state][idx],
            Err(_) => DEAD_STATE,
        }
    }

    /// Transition by symbol index into [`Dfa::alphabet`]
    pub fn step_index(&self, state: usize, symbol_index: usize) -> usize {
        self.transitions[state][symbol_index]
    }

    /// Run the automaton, returning the initial state followed by the state
    /// after each byte (`word.len() + 1` entries)
    pub fn run(&self, word: &[u8]) -> Vec<usize> {
        let mut states = Vec::with_capacity(word.len() + 1);
        let mut state = self.start;
        states.push(state);
        for &b in word {
            state = self.step(state, b);
            states.push(state);
        }
        states
    }

    pub fn accepts(&self, word: &[u8]) -> bool {
        let end = word.iter().fold(self.start, |s, &b| self.step(s, b));
        self.is_accepting(end)
    }

    /// Render as a Graphviz digraph. Edges into the dead state are omitted.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph dfa {{");
        let _ = writeln!(out, "  rankdir=LR;");
        let _ = writeln!(out, "  label=\"{}\";", self.pattern.replace('"', "\\\""));
        let _ = writeln!(out, "  __start [shape=point];");
        for state in self.live_states() {
            let shape = if self.is_accepting(state) {
                "doublecircle"
            } else {
                "circle"
            };
            let _ = writeln!(out, "  s{state} [label=\"{state}\", shape={shape}];");
        }
        let _ = writeln!(out, "  __start -> s{};", self.start);

        for state in self.live_states() {
            // Group symbols that share a target into one labelled edge
            let mut by_target: BTreeMap<usize, Vec<char>> = BTreeMap::new();
            for (idx, &symbol) in self.alphabet.iter().enumerate() {
                let target = self.transitions[state][idx];
                if target != DEAD_STATE {
                    by_target.entry(target).or_default().push(symbol as char);
                }
            }
            for (target, symbols) in by_target {
                let label: Vec<String> = symbols.iter().map(char::to_string).collect();
                let _ = writeln!(
                    out,
                    "  s{state} -> s{target} [label=\"{}\"];",
                    label.join(",")
                );
            }
        }
        let _ = writeln!(out, "}}");
        out
    }
}

/// Intermediate automaton before renumbering; state 0 is the empty subset
struct RawDfa {
    transitions: Vec<Vec<usize>>,
    accepting: Vec<bool>,
    start: usize,
}

fn subset_construction(nfa: &Nfa, alphabet: &[u8]) -> RawDfa {
    let mut index: HashMap<BTreeSet<usize>, usize> = HashMap::new();
    let mut sets: Vec<BTreeSet<usize>> = Vec::new();
    let mut transitions: Vec<Vec<usize>> = Vec::new();

    let empty = BTreeSet::new();
    index.insert(empty.clone(), 0);
    sets.push(empty);

    let start_set = nfa.closure([nfa.start]);
    let start = *index.entry(start_set.clone()).or_insert_with(|| {
        sets.push(start_set);
        sets.len() - 1
    });

    let mut next = 0;
    while next < sets.len() {
        let current = sets[next].clone();
        let mut row = Vec::with_capacity(alphabet.len());
        for &symbol in alphabet {
            let target = nfa.closure(nfa.step(&current, symbol));
            let id = match index.get(&target) {
                Some(&id) => id,
                None => {
                    sets.push(target.clone());
                    index.insert(target, sets.len() - 1);
                    sets.len() - 1
                }
            };
            row.push(id);
        }
        transitions.push(row);
        next += 1;
    }

    let accepting = sets.iter().map(|s| s.contains(&nfa.accept)).collect();
    RawDfa {
        transitions,
        accepting,
        start,
    }
}

/// Moore partition refinement; the block holding the empty subset becomes state 0
fn minimize(raw: &RawDfa) -> RawDfa {
    let n = raw.transitions.len();
    let mut block: Vec<usize> = raw.accepting.iter().map(|&a| usize::from(a)).collect();
    let mut n_blocks = block.iter().collect::<BTreeSet<_>>().len();

    loop {
        let mut signatures: HashMap<(usize, Vec<usize>), usize> = HashMap::new();
        let mut refined = vec![0; n];
        for state in 0..n {
            let successors = raw.transitions[state].iter().map(|&t| block[t]).collect();
            let key = (block[state], successors);
            let fresh = signatures.len();
            refined[state] = *signatures.entry(key).or_insert(fresh);
        }
        let refined_blocks = signatures.len();
        block = refined;
        if refined_blocks == n_blocks {
            break;
        }
        n_blocks = refined_blocks;
    }

    let mut transitions = vec![Vec::new(); n_blocks];
    let mut accepting = vec![false; n_blocks];
    for state in 0..n {
        let b = block[state];
        if transitions[b].is_empty() {
            transitions[b] = raw.transitions[state].iter().map(|&t| block[t]).collect();
            accepting[b] = raw.accepting[state];
        }
    }

    // Keep the dead block at index 0 so `renumber` can find it
    let dead = block[0];
    let mut order: Vec<usize> = (0..n_blocks).collect();
    order.swap(0, dead);
    let mut position = vec![0; n_blocks];
    for (new, &old) in order.iter().enumerate() {
        position[old] = new;
    }

    RawDfa {
        transitions: order
            .iter()
            .map(|&old| transitions[old].iter().map(|&t| position[t]).collect())
            .collect(),
        accepting: order.iter().map(|&old| accepting[old]).collect(),
        start: position[block[raw.start]],
    }
}

/// Breadth-first renumbering from the start state; dead state stays 0
fn renumber(minimal: &RawDfa) -> Dfa {
    let n = minimal.transitions.len();
    let mut ids: Vec<Option<usize>> = vec![None; n];
    ids[0] = Some(DEAD_STATE);

    let mut order = vec![0];
    let mut queue = VecDeque::new();
    if minimal.start != 0 {
        ids[minimal.start] = Some(1);
        order.push(minimal.start);
        queue.push_back(minimal.start);
    }
    while let Some(state) = queue.pop_front() {
        for &target in &minimal.transitions[state] {
            if ids[target].is_none() {
                ids[target] = Some(order.len());
                order.push(target);
                queue.push_back(target);
            }
        }
    }

    let id = |s: usize| ids[s].unwrap_or(DEAD_STATE);
    Dfa {
        alphabet: Vec::new(),
        transitions: order
            .iter()
            .map(|&old| minimal.transitions[old].iter().map(|&t| id(t)).collect())
            .collect(),
        accepting: order.iter().map(|&old| minimal.accepting[old]).collect(),
        start: id(minimal.start),
        pattern: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARITY: &str = "((B|C)*AB*A)*(B|C)*";

    #[test]
    fn test_parity_dfa_states() {
        let dfa = Dfa::from_regex(PARITY).unwrap();
        assert_eq!(dfa.alphabet(), b"ABC");
        // dead + even + odd
        assert_eq!(dfa.n_states(), 3);
        assert_eq!(dfa.start(), 1);
        assert!(dfa.is_accepting(1));
        assert!(!dfa.is_accepting(2));
        assert!(!dfa.is_accepting(DEAD_STATE));

        assert_eq!(dfa.step(1, b'A'), 2);
        assert_eq!(dfa.step(1, b'B'), 1);
        assert_eq!(dfa.step(1, b'C'), 1);
        assert_eq!(dfa.step(2, b'A'), 1);
        assert_eq!(dfa.step(2, b'B'), 2);
        assert_eq!(dfa.step(2, b'C'), DEAD_STATE);
    }

    #[test]
    fn test_run_and_accepts() {
        let dfa = Dfa::from_regex(PARITY).unwrap();
        assert_eq!(dfa.run(b"BAAB"), vec![1, 1, 2, 1, 1]);
        assert!(dfa.accepts(b""));
        assert!(dfa.accepts(b"CABBA"));
        assert!(!dfa.accepts(b"CAB"));
        assert!(!dfa.accepts(b"ACA"));
        assert!(!dfa.accepts(b"AXA"));
    }

    #[test]
    fn test_minimization_merges_equivalent_states() {
        // (A|B)(A|B)* and (A|B)+ describe the same language
        let a = Dfa::from_regex("(A|B)(A|B)*").unwrap();
        let b = Dfa::from_regex("(A|B)+").unwrap();
        assert_eq!(a.n_states(), b.n_states());
        assert_eq!(a.n_states(), 3);
        for word in [&b""[..], b"A", b"AB", b"BBA"] {
            assert_eq!(a.accepts(word), b.accepts(word));
        }
    }

    #[test]
    fn test_empty_alternatives() {
        let dfa = Dfa::from_regex("(|)A(|)").unwrap();
        assert!(dfa.accepts(b"A"));
        assert!(!dfa.accepts(b""));
        assert!(!dfa.accepts(b"AA"));
    }

    #[test]
    fn test_dot_output() {
        let dfa = Dfa::from_regex(PARITY).unwrap();
        let dot = dfa.to_dot();
        assert!(dot.starts_with("digraph dfa {"));
        assert!(dot.contains("s1 [label=\"1\", shape=doublecircle];"));
        assert!(dot.contains("s2 [label=\"2\", shape=circle];"));
        assert!(dot.contains("s1 -> s1 [label=\"B,C\"];"));
        assert!(dot.contains("s2 -> s1 [label=\"A\"];"));
        assert!(!dot.contains("s0"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Dfa::from_regex("(A").is_err());
    }
}
