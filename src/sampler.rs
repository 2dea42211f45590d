//! Labeled training data drawn from a regular language
//!
//! Words are sampled uniformly among the accepted words of a given length
//! by counting accepting paths through the DFA, then walking it with
//! symbol weights proportional to the number of completions. Each row of
//! the completion table is rescaled by its maximum, so counts that would
//! overflow `f64` on long words keep their ratios.
//!
//! Each row of a batch is laid out as:
//!
//! ```text
//! tokens: [0, w_1, w_2, ..., w_n]              (n + 1 entries)
//! states: [q0, q0, q(w_1), ..., q(w_1..w_n)]   (n + 2 entries)
//! ```
//!
//! `states[p + 1]` is the automaton state after reading `tokens[p]`. The
//! seed token and trailing padding do not move the automaton.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dfa::Dfa;
use crate::tokens::{encode, PAD_TOKEN};

/// How word lengths are chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthMode {
    /// Every word has exactly `word_len` symbols
    #[default]
    Exact,
    /// Length uniform over the feasible lengths `0..=word_len`, padded with `0`
    UpTo,
}

/// One batch of token rows with their aligned automaton states
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    pub tokens: Vec<Vec<u32>>,
    pub states: Vec<Vec<u32>>,
}

impl LabeledBatch {
    /// `(batch, seq_len)` token tensor
    pub fn tokens_tensor(&self, device: &Device) -> Result<Tensor> {
        rows_to_tensor(&self.tokens, device)
    }
}

fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    ensure!(
        rows.iter().all(|r| r.len() == width),
        "Ragged rows cannot form a tensor"
    );
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Uniform sampler of accepted words with their state traces
pub struct DfaSampler {
    dfa: Dfa,
    word_len: usize,
    completions: CompletionTable,
    feasible_lengths: Vec<usize>,
    rng: StdRng,
}

impl DfaSampler {
    pub fn new(dfa: Dfa, word_len: usize, mode: LengthMode, seed: u64) -> Result<Self> {
        let completions = CompletionTable::new(&dfa, word_len);
        let start = dfa.start();
        let feasible_lengths: Vec<usize> = match mode {
            LengthMode::Exact => vec![word_len],
            LengthMode::UpTo => (0..=word_len).collect(),
        }
        .into_iter()
        .filter(|&len| completions.rows[len][start] > 0.0)
        .collect();

        ensure!(
            !feasible_lengths.is_empty(),
            "Regex '{}' accepts no word of length {}{}",
            dfa.pattern(),
            if mode == LengthMode::UpTo { "at most " } else { "" },
            word_len
        );

        let sampler = Self {
            dfa,
            word_len,
            completions,
            feasible_lengths,
            rng: StdRng::seed_from_u64(seed),
        };
        debug!(
            "'{}': ln(#words of length {word_len}) = {:.2}",
            sampler.dfa.pattern(),
            sampler.ln_n_words(word_len)
        );
        Ok(sampler)
    }

    pub fn dfa(&self) -> &Dfa {
        &self.dfa
    }

    /// Natural log of the number of accepted words of exactly `len` symbols
    ///
    /// `-inf` when there are none or `len` exceeds the sampler's word length.
    pub fn ln_n_words(&self, len: usize) -> f64 {
        self.completions.ln_count(len, self.dfa.start())
    }

    /// Draw one accepted word
    pub fn sample_word(&mut self) -> Result<Vec<u8>> {
        let len = self.feasible_lengths[self.rng.gen_range(0..self.feasible_lengths.len())];
        let alphabet = self.dfa.alphabet().to_vec();
        let mut word = Vec::with_capacity(len);
        let mut state = self.dfa.start();
        for remaining in (1..=len).rev() {
            let weights: Vec<f64> = (0..alphabet.len())
                .map(|i| self.completions.rows[remaining - 1][self.dfa.step_index(state, i)])
                .collect();
            let choice = WeightedIndex::new(&weights)?.sample(&mut self.rng);
            word.push(alphabet[choice]);
            state = self.dfa.step_index(state, choice);
        }
        Ok(word)
    }

    /// Draw `batch_size` rows laid out as described in the module docs
    pub fn sample_batch(&mut self, batch_size: usize) -> Result<LabeledBatch> {
        let mut tokens = Vec::with_capacity(batch_size);
        let mut states = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let word = self.sample_word()?;
            let trace = self.dfa.run(&word);

            let mut token_row = Vec::with_capacity(self.word_len + 1);
            token_row.push(PAD_TOKEN);
            token_row.extend(encode(&word));
            token_row.resize(self.word_len + 1, PAD_TOKEN);

            let mut state_row = Vec::with_capacity(self.word_len + 2);
            state_row.push(trace[0] as u32);
            state_row.extend(trace.iter().map(|&s| s as u32));
            let last = *state_row.last().unwrap_or(&0);
            state_row.resize(self.word_len + 2, last);

            tokens.push(token_row);
            states.push(state_row);
        }
        Ok(LabeledBatch { tokens, states })
    }

    /// Endless stream of batches
    pub fn batches(self, batch_size: usize) -> Batches {
        Batches {
            sampler: self,
            batch_size,
        }
    }
}

/// Iterator over freshly sampled batches; never ends
pub struct Batches {
    sampler: DfaSampler,
    batch_size: usize,
}

impl Iterator for Batches {
    type Item = Result<LabeledBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.sampler.sample_batch(self.batch_size))
    }
}

/// Accepting-path counts by remaining length
///
/// The true count of accepted words of length `r` from state `s` is
/// `rows[r][s] * exp(ln_scale[r])`. Every row has maximum 1 (or is all zero),
/// so symbol weights taken from one row stay finite at any length.
struct CompletionTable {
    rows: Vec<Vec<f64>>,
    ln_scale: Vec<f64>,
}

impl CompletionTable {
    fn new(dfa: &Dfa, max_len: usize) -> Self {
        let n = dfa.n_states();
        let mut rows = Vec::with_capacity(max_len + 1);
        let mut ln_scale = Vec::with_capacity(max_len + 1);
        rows.push(
            (0..n)
                .map(|s| if dfa.is_accepting(s) { 1.0 } else { 0.0 })
                .collect::<Vec<f64>>(),
        );
        ln_scale.push(0.0);
        for r in 1..=max_len {
            let prev = &rows[r - 1];
            let mut row: Vec<f64> = (0..n)
                .map(|s| {
                    (0..dfa.alphabet().len())
                        .map(|i| prev[dfa.step_index(s, i)])
                        .sum()
                })
                .collect();
            let max = row.iter().copied().fold(0.0, f64::max);
            let mut scale = ln_scale[r - 1];
            if max > 0.0 {
                row.iter_mut().for_each(|c| *c /= max);
                scale += max.ln();
            }
            rows.push(row);
            ln_scale.push(scale);
        }
        Self { rows, ln_scale }
    }

    fn ln_count(&self, len: usize, state: usize) -> f64 {
        match self.rows.get(len) {
            Some(row) if row[state] > 0.0 => row[state].ln() + self.ln_scale[len],
            _ => f64::NEG_INFINITY,
        }
    }
}

/// Regex-backed generator of labeled batches
pub struct DfaGenerator {
    dfa: Dfa,
}

impl DfaGenerator {
    pub fn from_regex(pattern: &str) -> Result<Self> {
        Ok(Self {
            dfa: Dfa::from_regex(pattern)?,
        })
    }

    pub fn dfa(&self) -> &Dfa {
        &self.dfa
    }

    /// Endless stream of `(tokens, states)` batches of words of `word_len`
    pub fn batches_and_states(
        &self,
        word_len: usize,
        batch_size: usize,
        mode: LengthMode,
        seed: u64,
    ) -> Result<Batches> {
        Ok(DfaSampler::new(self.dfa.clone(), word_len, mode, seed)?.batches(batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PARITY_REGEX;

    #[test]
    fn test_completion_counts() {
        let dfa = Dfa::from_regex(PARITY_REGEX).unwrap();
        let sampler = DfaSampler::new(dfa, 3, LengthMode::Exact, 0).unwrap();
        let count = |len| sampler.ln_n_words(len).exp();
        assert!((count(0) - 1.0).abs() < 1e-9);
        // B, C
        assert!((count(1) - 2.0).abs() < 1e-9);
        // AA, BB, BC, CB, CC
        assert!((count(2) - 5.0).abs() < 1e-9);
        assert_eq!(sampler.ln_n_words(4), f64::NEG_INFINITY);
    }

    #[test]
    fn test_long_words_do_not_overflow() {
        let dfa = Dfa::from_regex(PARITY_REGEX).unwrap();
        let mut sampler = DfaSampler::new(dfa.clone(), 1000, LengthMode::Exact, 4).unwrap();
        // About 1000 * ln(2.618), far past f64::MAX
        let ln_count = sampler.ln_n_words(1000);
        assert!(ln_count.is_finite() && ln_count > f64::MAX.ln());
        for _ in 0..3 {
            let word = sampler.sample_word().unwrap();
            assert_eq!(word.len(), 1000);
            assert!(dfa.accepts(&word));
        }

        let mut up_to = DfaSampler::new(dfa.clone(), 900, LengthMode::UpTo, 5).unwrap();
        let batch = up_to.sample_batch(4).unwrap();
        for tokens in &batch.tokens {
            let word: Vec<u8> = tokens[1..]
                .iter()
                .take_while(|&&t| t != PAD_TOKEN)
                .map(|&t| t as u8)
                .collect();
            assert!(dfa.accepts(&word));
        }
    }


    #[test]
    fn test_batch_layout() {
        let dfa = Dfa::from_regex(PARITY_REGEX).unwrap();
        let mut sampler = DfaSampler::new(dfa.clone(), 10, LengthMode::Exact, 1).unwrap();
        let batch = sampler.sample_batch(16).unwrap();

        assert_eq!(batch.tokens.len(), 16);
        assert!(batch.tokens.iter().all(|row| row.len() == 11));
        for (tokens, states) in batch.tokens.iter().zip(&batch.states) {
            assert_eq!(tokens[0], PAD_TOKEN);
            assert_eq!(states.len(), 12);
            let word: Vec<u8> = tokens[1..].iter().map(|&t| t as u8).collect();
            assert!(dfa.accepts(&word));

            let trace: Vec<u32> = dfa.run(&word).into_iter().map(|s| s as u32).collect();
            assert_eq!(states[0], trace[0]);
            assert_eq!(&states[1..], &trace[..]);
            assert!(states.iter().all(|&s| s == 1 || s == 2));
        }
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let generator = DfaGenerator::from_regex(PARITY_REGEX).unwrap();
        let mut a = generator.batches_and_states(12, 4, LengthMode::Exact, 9).unwrap();
        let mut b = generator.batches_and_states(12, 4, LengthMode::Exact, 9).unwrap();
        for _ in 0..3 {
            let x = a.next().unwrap().unwrap();
            let y = b.next().unwrap().unwrap();
            assert_eq!(x.tokens, y.tokens);
            assert_eq!(x.states, y.states);
        }
    }

    #[test]
    fn test_up_to_mode_pads() {
        let dfa = Dfa::from_regex("A(BB)*").unwrap();
        let mut sampler = DfaSampler::new(dfa.clone(), 6, LengthMode::UpTo, 3).unwrap();
        let batch = sampler.sample_batch(64).unwrap();
        let mut lengths = std::collections::BTreeSet::new();
        for (tokens, states) in batch.tokens.iter().zip(&batch.states) {
            assert_eq!(tokens.len(), 7);
            let word: Vec<u8> = tokens[1..]
                .iter()
                .take_while(|&&t| t != PAD_TOKEN)
                .map(|&t| t as u8)
                .collect();
            assert!(dfa.accepts(&word));
            lengths.insert(word.len());
            // State holds steady across padding
            let end = states[word.len() + 1];
            assert!(states[word.len() + 1..].iter().all(|&s| s == end));
        }
        // Only odd lengths 1, 3, 5 are feasible
        assert!(lengths.iter().all(|l| l % 2 == 1));
        assert!(lengths.len() > 1);
    }

    #[test]
    fn test_infeasible_length() {
        let dfa = Dfa::from_regex("AA").unwrap();
        assert!(DfaSampler::new(dfa.clone(), 3, LengthMode::Exact, 0).is_err());
        assert!(DfaSampler::new(dfa, 3, LengthMode::UpTo, 0).is_ok());
    }

    #[test]
    fn test_tensors() {
        let dfa = Dfa::from_regex(PARITY_REGEX).unwrap();
        let mut sampler = DfaSampler::new(dfa, 5, LengthMode::Exact, 0).unwrap();
        let batch = sampler.sample_batch(3).unwrap();
        let tokens = batch.tokens_tensor(&Device::Cpu).unwrap();
        assert_eq!(tokens.dims(), &[3, 6]);
    }
}
