//! Text segmentation into packable units.
//!
//! Text is reduced to a sequence of words. Each word remembers how strong the
//! boundary in front of it is, so the packer can prefer cutting at a paragraph
//! break, then a sentence end or line break, then a plain space, and only as a
//! last resort inside a word that is longer than the unit limit.

/// Strength of the boundary in front of a unit, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Break {
    /// Inside an over-long word
    Hard,
    Word,
    /// After `.`, `!`, `?` or at a single line break
    Sentence,
    Paragraph,
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub text: String,
    /// Length of `text` in chars
    pub chars: usize,
    pub brk: Break,
    /// Separator that re-joins this unit to the previous one
    pub sep: &'static str,
}

impl Unit {
    pub fn sep_chars(&self) -> usize {
        self.sep.len()
    }
}

/// Split `text` into words no longer than `max_unit` chars.
///
/// Whitespace runs collapse to a single separator: two or more newlines
/// become a paragraph break, one newline stays a line break, anything else
/// becomes a space. NUL characters are treated as whitespace.
pub fn split_units(text: &str, max_unit: usize) -> Vec<Unit> {
    let max_unit = max_unit.max(1);
    let mut units: Vec<Unit> = Vec::new();
    let mut word = String::new();
    let mut gap_newlines = 0usize;

    for c in text.chars() {
        if c.is_whitespace() || c == '\0' {
            if !word.is_empty() {
                push_word(&mut units, &word, gap_newlines, max_unit);
                word.clear();
                gap_newlines = 0;
            }
            if c == '\n' {
                gap_newlines += 1;
            }
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        push_word(&mut units, &word, gap_newlines, max_unit);
    }

    units
}

fn push_word(units: &mut Vec<Unit>, word: &str, gap_newlines: usize, max_unit: usize) {
    let (brk, sep) = match units.last() {
        None => (Break::Paragraph, ""),
        Some(_) if gap_newlines >= 2 => (Break::Paragraph, "\n\n"),
        Some(_) if gap_newlines == 1 => (Break::Sentence, "\n"),
        Some(prev) if ends_sentence(&prev.text) => (Break::Sentence, " "),
        Some(_) => (Break::Word, " "),
    };

    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= max_unit {
        units.push(Unit {
            text: word.to_string(),
            chars: chars.len(),
            brk,
            sep,
        });
        return;
    }

    for (i, piece) in chars.chunks(max_unit).enumerate() {
        let (brk, sep) = if i == 0 { (brk, sep) } else { (Break::Hard, "") };
        units.push(Unit {
            text: piece.iter().collect(),
            chars: piece.len(),
            brk,
            sep,
        });
    }
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(|c: char| matches!(c, '"' | '\'' | ')' | ']' | '”' | '’'));
    trimmed.ends_with(['.', '!', '?'])
}
