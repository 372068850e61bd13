use thiserror::Error;

pub const ORIGINAL: &str = "<<<<<<< ORIGINAL";
pub const DIVIDER: &str = "=======";
pub const FINAL: &str = ">>>>>>> UPDATED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockState {
    WritingOriginal,
    WritingFinal,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplaceBlock {
    pub original: String,
    pub replacement: String,
    pub state: BlockState,
}

/// Scans `text` for search/replace blocks with a single forward cursor.
///
/// Re-running on a longer text (same prefix) never shortens the result,
/// never moves a block's state backwards and never changes a `Done` block.
pub fn extract_search_replace_blocks(text: &str) -> Vec<SearchReplaceBlock> {
    let original_marker = format!("{ORIGINAL}\n");
    let divider_marker = format!("\n{DIVIDER}\n");
    let final_marker = format!("\n{FINAL}");

    let mut blocks = Vec::new();
    let mut cursor = 0;

    loop {
        let Some(found) = find_from(text, &original_marker, cursor) else {
            return blocks;
        };
        let original_start = found + original_marker.len();

        // The divider's leading newline may be the one that ended the ORIGINAL line.
        let Some(divider_at) = find_from(text, &divider_marker, original_start - 1) else {
            let partial = trailing_partial_marker_len(text, &divider_marker);
            blocks.push(SearchReplaceBlock {
                original: clamped_slice(text, original_start, text.len() - partial).to_string(),
                replacement: String::new(),
                state: BlockState::WritingOriginal,
            });
            return blocks;
        };
        let original = clamped_slice(text, original_start, divider_at).to_string();
        let replacement_start = divider_at + divider_marker.len();

        let Some(final_at) = find_from(text, &final_marker, replacement_start - 1) else {
            let partial = trailing_partial_marker_len(text, &final_marker);
            blocks.push(SearchReplaceBlock {
                original,
                replacement: clamped_slice(text, replacement_start, text.len() - partial)
                    .to_string(),
                state: BlockState::WritingFinal,
            });
            return blocks;
        };
        let replacement = clamped_slice(text, replacement_start, final_at).to_string();
        cursor = final_at + final_marker.len();

        blocks.push(SearchReplaceBlock {
            original,
            replacement,
            state: BlockState::Done,
        });
    }
}

fn find_from(text: &str, needle: &str, from: usize) -> Option<usize> {
    text.get(from..)?.find(needle).map(|offset| from + offset)
}

fn clamped_slice(text: &str, start: usize, end: usize) -> &str {
    if end <= start {
        ""
    } else {
        &text[start..end]
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
fn trailing_partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|len| marker.is_char_boundary(*len) && text.ends_with(&marker[..*len]))
        .unwrap_or(0)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("block {index}: original text not found")]
    OriginalNotFound { index: usize },
    #[error("block {index}: original text matches {count} locations; include more context")]
    AmbiguousOriginal { index: usize, count: usize },
    #[error("block {index}: empty original text is only allowed for an empty file")]
    EmptyOriginal { index: usize },
    #[error("no completed search/replace blocks found")]
    NoBlocks,
}

/// Applies every `Done` block in order. Each original must match exactly once
/// in the text produced by the blocks before it.
pub fn apply_search_replace_blocks(
    source: &str,
    blocks: &[SearchReplaceBlock],
) -> Result<String, EditError> {
    let mut current = source.to_string();
    let mut applied = 0;

    for (index, block) in blocks.iter().enumerate() {
        if block.state != BlockState::Done {
            continue;
        }
        applied += 1;

        if block.original.is_empty() {
            if !current.is_empty() {
                return Err(EditError::EmptyOriginal { index });
            }
            current = block.replacement.clone();
            continue;
        }

        let count = current.matches(block.original.as_str()).count();
        match count {
            0 => return Err(EditError::OriginalNotFound { index }),
            1 => current = current.replacen(block.original.as_str(), &block.replacement, 1),
            _ => return Err(EditError::AmbiguousOriginal { index, count }),
        }
    }

    if applied == 0 {
        return Err(EditError::NoBlocks);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_text(original: &str, replacement: &str) -> String {
        format!("{ORIGINAL}\n{original}\n{DIVIDER}\n{replacement}\n{FINAL}\n")
    }

    #[test]
    fn test_extracts_complete_blocks_in_order() {
        let text = format!(
            "Here are the edits:\n{}{}",
            block_text("let a = 1;", "let a = 2;"),
            block_text("fn old() {}", "fn new() {}")
        );
        let blocks = extract_search_replace_blocks(&text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].original, "let a = 1;");
        assert_eq!(blocks[0].replacement, "let a = 2;");
        assert_eq!(blocks[1].original, "fn old() {}");
        assert!(blocks.iter().all(|b| b.state == BlockState::Done));
    }

    #[test]
    fn test_partial_divider_is_trimmed_from_original() {
        let text = format!("{ORIGINAL}\nold line\n====");
        let blocks = extract_search_replace_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, BlockState::WritingOriginal);
        assert_eq!(blocks[0].original, "old line");
    }

    #[test]
    fn test_partial_final_marker_is_trimmed_from_replacement() {
        let text = format!("{ORIGINAL}\nold\n{DIVIDER}\nnew\n>>>>");
        let blocks = extract_search_replace_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, BlockState::WritingFinal);
        assert_eq!(blocks[0].original, "old");
        assert_eq!(blocks[0].replacement, "new");
    }

    #[test]
    fn test_incomplete_original_marker_yields_no_block() {
        assert!(extract_search_replace_blocks("<<<<<<< ORIGIN").is_empty());
        assert!(extract_search_replace_blocks(ORIGINAL).is_empty());
    }

    #[test]
    fn test_empty_replacement_is_a_deletion() {
        let text = format!("{ORIGINAL}\nremove me\n{DIVIDER}\n{FINAL}");
        let blocks = extract_search_replace_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, BlockState::Done);
        assert_eq!(blocks[0].replacement, "");
    }

    #[test]
    fn test_prefixes_progress_monotonically() {
        let full = format!(
            "intro\n{}between\n{}",
            block_text("a\nb", "c"),
            block_text("x", "")
        );
        let mut previous: Vec<SearchReplaceBlock> = Vec::new();
        for end in (0..=full.len()).filter(|i| full.is_char_boundary(*i)) {
            let blocks = extract_search_replace_blocks(&full[..end]);
            assert!(blocks.len() >= previous.len(), "shrank at {end}");
            for (before, after) in previous.iter().zip(blocks.iter()) {
                assert!(after.state >= before.state, "regressed at {end}");
                if before.state == BlockState::Done {
                    assert_eq!(before, after, "done block changed at {end}");
                }
            }
            previous = blocks;
        }
        assert_eq!(previous.len(), 2);
        assert!(previous.iter().all(|b| b.state == BlockState::Done));
    }

    #[test]
    fn test_apply_blocks_in_sequence() {
        let source = "fn main() {\n    let a = 1;\n    let b = 2;\n}\n";
        let blocks = extract_search_replace_blocks(&format!(
            "{}{}",
            block_text("    let a = 1;", "    let a = 10;"),
            block_text("    let b = 2;", "")
        ));
        let updated = apply_search_replace_blocks(source, &blocks).unwrap();
        assert_eq!(updated, "fn main() {\n    let a = 10;\n\n}\n");
    }

    #[test]
    fn test_apply_rejects_missing_and_ambiguous_originals() {
        let missing = extract_search_replace_blocks(&block_text("nope", "x"));
        assert_eq!(
            apply_search_replace_blocks("abc", &missing),
            Err(EditError::OriginalNotFound { index: 0 })
        );

        let ambiguous = extract_search_replace_blocks(&block_text("a", "b"));
        assert_eq!(
            apply_search_replace_blocks("a a", &ambiguous),
            Err(EditError::AmbiguousOriginal { index: 0, count: 2 })
        );
    }

    #[test]
    fn test_apply_ignores_unfinished_blocks() {
        let blocks = extract_search_replace_blocks(&format!("{ORIGINAL}\nabc\n"));
        assert_eq!(
            apply_search_replace_blocks("abc", &blocks),
            Err(EditError::NoBlocks)
        );
    }
}
