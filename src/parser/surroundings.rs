//! Restartable scanners that strip fences and FIM markers from model output
//! while it is still streaming.
//!
//! Every call works on the *whole* text received so far; nothing is carried
//! between calls, so a caller can re-run the extractor on each delta.

const FENCE: &str = "```";

/// A live window `[start, end)` over an immutable source string.
///
/// Offsets are byte offsets and always sit on char boundaries.
#[derive(Debug, Clone)]
pub struct SurroundingsRemover<'a> {
    source: &'a str,
    start: usize,
    end: usize,
}

impl<'a> SurroundingsRemover<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            start: 0,
            end: source.len(),
        }
    }

    pub fn value(&self) -> &'a str {
        if self.start >= self.end {
            return "";
        }
        &self.source[self.start..self.end]
    }

    pub fn is_exhausted(&self) -> bool {
        self.start >= self.end
    }

    /// Advances past as much of `prefix` as matches. Returns true only when all
    /// of it matched; a partial match still advances.
    pub fn remove_prefix(&mut self, prefix: &str) -> bool {
        let mut expected = prefix.chars();
        let mut consumed = 0;
        for actual in self.value().chars() {
            match expected.next() {
                Some(want) if want == actual => consumed += actual.len_utf8(),
                Some(_) => break,
                None => break,
            }
        }
        self.start += consumed;
        consumed == prefix.len()
    }

    /// Retracts `end` by the longest prefix of `suffix` that the live window
    /// ends with. Returns true only when the whole suffix matched.
    pub fn remove_suffix(&mut self, suffix: &str) -> bool {
        let live = self.value();
        let mut prefix_ends: Vec<usize> = suffix
            .char_indices()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .filter(|len| *len <= live.len())
            .collect();
        prefix_ends.reverse();

        for len in prefix_ends {
            if live.ends_with(&suffix[..len]) {
                self.end -= len;
                return len == suffix.len();
            }
        }
        false
    }

    /// Moves `start` to the first `marker` at or after it, or past it when
    /// `consume_marker` is set. Without a match the whole window is consumed.
    pub fn remove_from_start_until(&mut self, marker: &str, consume_marker: bool) -> bool {
        match self.source[self.start..].find(marker) {
            Some(offset) => {
                let at = self.start + offset;
                let next = if consume_marker { at + marker.len() } else { at };
                self.start = next.min(self.end);
                true
            }
            None => {
                self.start = self.end;
                false
            }
        }
    }

    /// Like [`Self::remove_prefix`], but a mismatch that is not explained by
    /// the text running out is rolled back.
    fn remove_opening(&mut self, prefix: &str) -> bool {
        let before = self.start;
        if self.remove_prefix(prefix) {
            return true;
        }
        if !self.is_exhausted() {
            self.start = before;
        }
        false
    }

    /// Strips a leading fence (with optional language tag) and a trailing
    /// fence. Returns false when the text does not open with a fence.
    pub fn remove_code_block(&mut self) -> bool {
        if !self.remove_opening(FENCE) {
            return false;
        }
        self.remove_from_start_until("\n", true);

        let before = self.end;
        let closed = self.remove_suffix("\n```");
        if !closed && self.end == before {
            self.remove_suffix(FENCE);
        }
        true
    }

    /// Splits the newest `recently_added_len` bytes of the source into the
    /// part inside the live window and the part withheld after it.
    pub fn delta_info(&self, recently_added_len: usize) -> (&'a str, &'a str) {
        let recent_start = floor_char_boundary(
            self.source,
            self.source.len().saturating_sub(recently_added_len),
        );
        let delta_start = self.start.max(recent_start);
        let delta = if delta_start < self.end {
            &self.source[delta_start..self.end]
        } else {
            ""
        };
        let withheld = &self.source[self.end.max(recent_start)..];
        (delta, withheld)
    }
}

fn floor_char_boundary(source: &str, mut idx: usize) -> usize {
    while idx > 0 && !source.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Output of the code extractors for one streaming tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractedCode<'a> {
    /// Code with the surrounding fence/markers removed.
    pub value: &'a str,
    /// Slice of `value` that arrived in the latest delta.
    pub delta: &'a str,
    /// Tail of the latest delta held back, e.g. a closing fence in progress.
    pub withheld: &'a str,
}

pub fn extract_code_from_regular(text: &str, recently_added_len: usize) -> ExtractedCode<'_> {
    let mut remover = SurroundingsRemover::new(text);
    remover.remove_code_block();
    let (delta, withheld) = remover.delta_info(recently_added_len);
    ExtractedCode {
        value: remover.value(),
        delta,
        withheld,
    }
}

/// Same as [`extract_code_from_regular`], then strips `<mid_tag>...</mid_tag>`
/// for providers that echo fill-in-middle markers.
pub fn extract_code_from_fim<'a>(
    text: &'a str,
    recently_added_len: usize,
    mid_tag: &str,
) -> ExtractedCode<'a> {
    let mut remover = SurroundingsRemover::new(text);
    remover.remove_code_block();
    if remover.remove_opening(&format!("<{mid_tag}>")) {
        remover.remove_suffix("\n");
        remover.remove_suffix(&format!("</{mid_tag}>"));
    }
    let (delta, withheld) = remover.delta_info(recently_added_len);
    ExtractedCode {
        value: remover.value(),
        delta,
        withheld,
    }
}
