//! Passphrase generation from the embedded dice word list.

use rand::Rng;
use thiserror::Error;

use conclave_common::constants::PASSPHRASE_WORDS;

/// `<dice index>\t<word>` per line
const WORDLIST: &str = include_str!("wordlist.txt");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PassphraseError {
    #[error("Invalid wordlist line {line}: {content:?}")]
    InvalidWordlist { line: usize, content: String },

    #[error("Wordlist is empty")]
    EmptyWordlist,

    #[error("Passphrase must contain exactly {expected} words, got {got}")]
    WordCount { expected: usize, got: usize },
}

/// Parse a word list of `<dice index>\t<word>` lines
pub fn parse_wordlist(raw: &str) -> Result<Vec<&str>, PassphraseError> {
    let mut words = Vec::new();

    for (i, line) in raw.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let invalid = || PassphraseError::InvalidWordlist {
            line: i + 1,
            content: line.to_string(),
        };

        let (index, word) = line.split_once('\t').ok_or_else(invalid)?;
        let index_ok = !index.is_empty() && index.chars().all(|c| ('1'..='6').contains(&c));
        let word_ok = !word.is_empty() && !word.contains(char::is_whitespace);
        if !index_ok || !word_ok {
            return Err(invalid());
        }

        words.push(word);
    }

    if words.is_empty() {
        return Err(PassphraseError::EmptyWordlist);
    }

    Ok(words)
}

/// Draw a fresh passphrase from the embedded word list
pub fn generate_passphrase() -> Result<String, PassphraseError> {
    generate_from(WORDLIST)
}

/// Draw `PASSPHRASE_WORDS` words uniformly, with replacement
pub fn generate_from(raw: &str) -> Result<String, PassphraseError> {
    let words = parse_wordlist(raw)?;
    let mut rng = rand::rng();

    let picked: Vec<&str> = (0..PASSPHRASE_WORDS)
        .map(|_| words[rng.random_range(0..words.len())])
        .collect();

    Ok(picked.join(" "))
}

/// Normalise operator input: lowercase, single spaces, exact word count
pub fn format_passphrase(input: &str) -> Result<String, PassphraseError> {
    let words: Vec<String> = input.split_whitespace().map(str::to_lowercase).collect();
    if words.len() != PASSPHRASE_WORDS {
        return Err(PassphraseError::WordCount {
            expected: PASSPHRASE_WORDS,
            got: words.len(),
        });
    }

    Ok(words.join(" "))
}
