use threadloop::parser::{
    apply_search_replace_blocks, extract_code_from_regular, extract_search_replace_blocks,
    BlockState, DIVIDER, FINAL, ORIGINAL,
};

fn char_prefixes(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .map(|(idx, _)| &text[..idx])
        .chain(std::iter::once(text))
}

#[test]
fn test_search_replace_extraction_is_monotonic_while_streaming() {
    let reply = format!(
        "Here is the fix:\n{ORIGINAL}\nlet total = a + b;\n{DIVIDER}\nlet total = a.saturating_add(b);\n{FINAL}\n\
         and the rename:\n{ORIGINAL}\nfn sum(\n{DIVIDER}\nfn checked_sum(\n{FINAL}\nDone. ✓"
    );

    let mut previous: Vec<threadloop::parser::SearchReplaceBlock> = Vec::new();
    for prefix in char_prefixes(&reply) {
        let blocks = extract_search_replace_blocks(prefix);
        assert!(blocks.len() >= previous.len(), "block count shrank at {prefix:?}");
        for (before, after) in previous.iter().zip(&blocks) {
            assert!(after.state >= before.state, "state regressed at {prefix:?}");
            if before.state == BlockState::Done {
                assert_eq!(before, after);
            }
            if before.state == BlockState::WritingFinal {
                assert_eq!(before.original, after.original);
            }
        }
        previous = blocks;
    }

    assert_eq!(previous.len(), 2);
    assert!(previous.iter().all(|block| block.state == BlockState::Done));

    let source = "fn sum(a: u8, b: u8) -> u8 {\n    let total = a + b;\n    total\n}\n";
    let updated = apply_search_replace_blocks(source, &previous).unwrap();
    assert_eq!(
        updated,
        "fn checked_sum(a: u8, b: u8) -> u8 {\n    let total = a.saturating_add(b);\n    total\n}\n"
    );
}

#[test]
fn test_code_extraction_never_shrinks_while_streaming() {
    let reply = "```rust\nfn main() {\n    println!(\"héllo\");\n}\n```";
    let mut previous_len = 0;
    let mut previous_text = "";

    for prefix in char_prefixes(reply) {
        let added = prefix.len() - previous_text.len();
        let extracted = extract_code_from_regular(prefix, added);
        if !extracted.value.is_empty() {
            assert!(
                extracted.value.len() >= previous_len,
                "extracted code shrank at {prefix:?}"
            );
            previous_len = extracted.value.len();
        }
        previous_text = prefix;
    }

    let done = extract_code_from_regular(reply, 5);
    assert_eq!(done.value, "fn main() {\n    println!(\"héllo\");\n}");
    assert_eq!(done.withheld, "\n```");
}
