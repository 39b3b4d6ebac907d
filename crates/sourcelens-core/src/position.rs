use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspPosition {
    pub line: u32,
    /// UTF-16 code unit offset within the line.
    pub character: u32,
}

impl LspPosition {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Number of leading characters the page's plain-text rendering drops from a
/// line before the browser reports a column: spaces and dots only.
///
/// Tabs are not counted.
pub fn leading_skip(text: &str) -> u32 {
    text.chars().take_while(|c| *c == ' ' || *c == '.').count() as u32
}

/// Maps a column reported against extracted page text back onto the source
/// line by re-adding the characters the extraction skipped.
pub fn adjust_for_extracted_text(line: u32, character: u32, text: &str) -> LspPosition {
    LspPosition {
        line,
        character: character.saturating_add(leading_skip(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_spaces_and_dots() {
        assert_eq!(leading_skip("    let x = 1"), 4);
        assert_eq!(leading_skip("..foo"), 2);
        assert_eq!(leading_skip(" . .bar"), 4);
        assert_eq!(leading_skip("bar"), 0);
        assert_eq!(leading_skip(""), 0);
    }

    #[test]
    fn tabs_are_not_counted() {
        assert_eq!(leading_skip("\tfoo"), 0);
        assert_eq!(leading_skip("  \tfoo"), 2);
    }

    #[test]
    fn adjusts_character_by_skip() {
        let pos = adjust_for_extracted_text(3, 5, "    value.count");
        assert_eq!(pos, LspPosition::new(3, 9));
    }

    #[test]
    fn adjustment_saturates() {
        let pos = adjust_for_extracted_text(0, u32::MAX, "  x");
        assert_eq!(pos.character, u32::MAX);
    }
}
