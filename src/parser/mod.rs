//! Incremental extraction of structured edits from streamed model text.

mod search_replace;
mod surroundings;

pub use search_replace::{
    apply_search_replace_blocks, extract_search_replace_blocks, BlockState, EditError,
    SearchReplaceBlock, DIVIDER, FINAL, ORIGINAL,
};
pub use surroundings::{
    extract_code_from_fim, extract_code_from_regular, ExtractedCode, SurroundingsRemover,
};
