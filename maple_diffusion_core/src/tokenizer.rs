use std::collections::HashMap;

use tracing::warn;

use crate::error::{DiffusionError, Result};
use crate::weights::ModelWeights;

/// Fixed prompt window of the text encoder.
pub const PROMPT_LENGTH: usize = 77;
/// Start-of-text marker, one past the last vocabulary entry.
pub const BOS_TOKEN: u32 = 49_406;
/// End-of-text marker, doubling as padding.
pub const EOS_TOKEN: u32 = 49_407;

const MAX_PROMPT_TOKENS: usize = PROMPT_LENGTH - 2;
const MERGE_COUNT: usize = 48_894;
const MERGE_CAP: usize = 8_192;
const VOCAB_FILE: &str = "bpe_simple_vocab_16e6.txt";

// Contractions are split off a word only when they start it; anywhere else
// the whole word is taken as one run, apostrophe included.
const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

/// Byte-pair tokenizer with the text encoder's vocabulary.
///
/// Words are mapped byte-by-byte onto a printable alphabet, the final symbol
/// is tagged with `</w>`, and adjacent symbols are then greedily merged in
/// ascending rank order until no ranked pair remains.
pub struct ClipTokenizer {
    byte_symbols: [char; 256],
    ranks: HashMap<String, usize>,
    vocab: HashMap<String, u32>,
}

impl ClipTokenizer {
    pub fn new(weights: &ModelWeights) -> Result<Self> {
        Self::from_merges(&weights.text_file(VOCAB_FILE)?)
    }

    /// Build the tokenizer from the raw merge-rank table. The first line is a
    /// header; the next 48 894 lines each hold one space-separated merge pair.
    pub fn from_merges(merge_table: &str) -> Result<Self> {
        let mut byte_symbols = ['\0'; 256];
        let mut vocab_list: Vec<String> = Vec::with_capacity(512 + MERGE_COUNT);

        // Bytes that are printable on their own keep their identity.
        for c in ('!'..='~').chain('¡'..='¬').chain('®'..='ÿ') {
            byte_symbols[c as usize] = c;
            vocab_list.push(c.to_string());
        }
        // The rest are remapped to fresh scalars starting at U+0100.
        let mut next = 256u32;
        for b in 0..256usize {
            if byte_symbols[b] != '\0' {
                continue;
            }
            if let Some(c) = char::from_u32(next) {
                byte_symbols[b] = c;
                vocab_list.push(c.to_string());
            }
            next += 1;
        }
        let word_final: Vec<String> = vocab_list.iter().map(|s| format!("{s}</w>")).collect();
        vocab_list.extend(word_final);

        let mut ranks = HashMap::with_capacity(MERGE_COUNT);
        for (rank, line) in merge_table.lines().skip(1).take(MERGE_COUNT).enumerate() {
            let (first, second) = line.split_once(' ').ok_or_else(|| {
                DiffusionError::Vocab(format!("merge line {} is not a pair: {line:?}", rank + 1))
            })?;
            ranks.insert(line.to_string(), rank);
            vocab_list.push(format!("{first}{second}"));
        }
        if vocab_list.len() != 512 + MERGE_COUNT {
            return Err(DiffusionError::Vocab(format!(
                "expected {MERGE_COUNT} merge rules, found {}",
                vocab_list.len() - 512
            )));
        }

        let vocab = vocab_list
            .into_iter()
            .enumerate()
            .map(|(i, s)| (s, i as u32))
            .collect();
        Ok(Self {
            byte_symbols,
            ranks,
            vocab,
        })
    }

    /// Encode a prompt into exactly [`PROMPT_LENGTH`] token ids: start marker,
    /// content tokens, end-marker padding. Prompts longer than 75 content
    /// tokens are truncated with a warning.
    pub fn encode(&self, text: &str) -> Result<[u32; PROMPT_LENGTH]> {
        let cleaned = text.to_lowercase();
        let mut ids = Vec::new();
        for run in cleaned.split_whitespace() {
            for word in split_leading_contractions(run) {
                self.encode_word(word, &mut ids)?;
            }
        }
        if ids.len() > MAX_PROMPT_TOKENS {
            warn!(
                tokens = ids.len(),
                "prompt truncated to {MAX_PROMPT_TOKENS} tokens"
            );
            ids.truncate(MAX_PROMPT_TOKENS);
        }
        let mut out = [EOS_TOKEN; PROMPT_LENGTH];
        out[0] = BOS_TOKEN;
        out[1..=ids.len()].copy_from_slice(&ids);
        Ok(out)
    }

    fn encode_word(&self, word: &str, out: &mut Vec<u32>) -> Result<()> {
        let mut symbols: Vec<String> = word
            .bytes()
            .map(|b| self.byte_symbols[b as usize].to_string())
            .collect();
        match symbols.last_mut() {
            Some(last) => last.push_str("</w>"),
            None => return Ok(()),
        }

        let mut iterations = 0;
        while symbols.len() > 1 {
            iterations += 1;
            if iterations > MERGE_CAP {
                return Err(DiffusionError::Vocab(format!(
                    "merge loop did not converge for {word:?}"
                )));
            }
            // Lowest-ranked bigram present in the word, if any.
            let mut best: Option<(usize, usize)> = None;
            for i in 0..symbols.len() - 1 {
                let key = format!("{} {}", symbols[i], symbols[i + 1]);
                if let Some(&rank) = self.ranks.get(&key) {
                    if best.map_or(true, |(r, _)| rank < r) {
                        best = Some((rank, i));
                    }
                }
            }
            let Some((_, at)) = best else { break };
            let first = symbols[at].clone();
            let second = symbols[at + 1].clone();

            // Merge every occurrence of the pair in one left-to-right pass.
            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == first && symbols[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut symbols[i]));
                    i += 1;
                }
            }
            symbols = merged;
        }

        for symbol in &symbols {
            let id = self.vocab.get(symbol).ok_or_else(|| {
                DiffusionError::Vocab(format!("symbol {symbol:?} missing from vocabulary"))
            })?;
            out.push(*id);
        }
        Ok(())
    }
}

fn split_leading_contractions(mut run: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    'outer: while !run.is_empty() {
        for prefix in CONTRACTIONS {
            if let Some(rest) = run.strip_prefix(prefix) {
                pieces.push(&run[..prefix.len()]);
                run = rest;
                continue 'outer;
            }
        }
        pieces.push(run);
        break;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn merge_table() -> String {
        let mut table = String::from("#version: 0.2\n");
        for line in ["h e", "he l", "hel l", "hell o</w>"] {
            table.push_str(line);
            table.push('\n');
        }
        for i in 0..MERGE_COUNT - 4 {
            writeln!(table, "x{i} y{i}").unwrap();
        }
        table
    }

    fn byte_id(c: char) -> u32 {
        c as u32 - 33
    }

    fn final_byte_id(c: char) -> u32 {
        256 + byte_id(c)
    }

    #[test]
    fn merges_follow_rank_order() {
        let tokenizer = ClipTokenizer::from_merges(&merge_table()).unwrap();
        let ids = tokenizer.encode("Hello WORLD").unwrap();

        assert_eq!(ids.len(), PROMPT_LENGTH);
        assert_eq!(ids[0], BOS_TOKEN);
        // "hello" collapses to the fully merged entry at 512 + rank 3.
        assert_eq!(ids[1], 515);
        // "world" has no applicable merges and stays byte-level.
        assert_eq!(
            &ids[2..7],
            &[
                byte_id('w'),
                byte_id('o'),
                byte_id('r'),
                byte_id('l'),
                final_byte_id('d'),
            ]
        );
        assert!(ids[7..].iter().all(|&id| id == EOS_TOKEN));
        assert_eq!(ids, tokenizer.encode("Hello WORLD").unwrap());
    }

    #[test]
    fn contractions_split_only_at_word_start() {
        let tokenizer = ClipTokenizer::from_merges(&merge_table()).unwrap();

        // Apostrophe mid-word is kept inside the word.
        let ids = tokenizer.encode("a's").unwrap();
        assert_eq!(
            &ids[1..4],
            &[byte_id('a'), byte_id('\''), final_byte_id('s')]
        );

        // A word starting with a contraction is split off.
        let ids = tokenizer.encode("'s a").unwrap();
        assert_eq!(
            &ids[1..4],
            &[byte_id('\''), final_byte_id('s'), final_byte_id('a')]
        );
    }

    #[test]
    fn long_prompts_truncate_to_window() {
        let tokenizer = ClipTokenizer::from_merges(&merge_table()).unwrap();
        let prompt = vec!["a"; 100].join(" ");
        let ids = tokenizer.encode(&prompt).unwrap();

        assert_eq!(ids.len(), PROMPT_LENGTH);
        assert_eq!(ids[0], BOS_TOKEN);
        assert!(ids[1..76].iter().all(|&id| id == final_byte_id('a')));
        assert_eq!(ids[76], EOS_TOKEN);
    }

    #[test]
    fn rejects_malformed_merge_table() {
        let err = ClipTokenizer::from_merges("header\nnospace\n");
        assert!(matches!(err, Err(DiffusionError::Vocab(_))));
    }
}
