use crate::util::char_len;
use anyhow::{Result, bail};
use serde::Serialize;

/// Ordered, index-addressed slices of one document.
///
/// Concatenating `chunks[i].text` for `i` in order always reproduces the source
/// exactly, and the same text with the same bound always yields the same
/// boundaries, so a resumed run can match chunk indices against a metadata
/// snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPlan {
    pub max_chunk_size: usize,
    pub total_chars: usize,
    pub chunks: Vec<PlannedChunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedChunk {
    pub index: usize,
    pub chars: usize,
    #[serde(skip)]
    pub text: String,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_texts(self) -> Vec<String> {
        self.chunks.into_iter().map(|c| c.text).collect()
    }
}

/// Splits `text` on line boundaries into chunks of at most `max_chunk_size`
/// chars. Lines longer than the bound are cut at the last whitespace that fits,
/// or hard-cut at the bound when a single word is longer than that.
pub fn plan(text: &str, max_chunk_size: usize) -> Result<ChunkPlan> {
    if max_chunk_size == 0 {
        bail!("max_chunk_size must be > 0");
    }

    let mut texts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for line in text.split_inclusive('\n') {
        let line_chars = char_len(line);

        if current_chars + line_chars <= max_chunk_size {
            current.push_str(line);
            current_chars += line_chars;
            continue;
        }

        if !current.is_empty() {
            texts.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        if line_chars <= max_chunk_size {
            current.push_str(line);
            current_chars = line_chars;
            continue;
        }

        let mut pieces = cut_long_line(line, max_chunk_size);
        // The tail of an oversized line may share a chunk with the lines after it.
        if let Some(last) = pieces.pop() {
            texts.extend(pieces);
            current_chars = char_len(&last);
            current = last;
        }
    }

    if !current.is_empty() {
        texts.push(current);
    }

    let chunks = texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| PlannedChunk {
            index,
            chars: char_len(&text),
            text,
        })
        .collect();

    Ok(ChunkPlan {
        max_chunk_size,
        total_chars: char_len(text),
        chunks,
    })
}

fn cut_long_line(line: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = line;

    while char_len(rest) > max {
        let window_end = rest
            .char_indices()
            .nth(max)
            .map(|(b, _)| b)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        // Prefer cutting right after whitespace in the back half of the window.
        let cut = window
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(b, c)| b + c.len_utf8())
            .filter(|&b| char_len(&window[..b]) * 2 >= max)
            .last()
            .unwrap_or(window_end);

        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Splits `text` into two contiguous, non-empty halves near the middle,
/// preferring a paragraph break, then a line break, then a sentence end, then
/// any whitespace, within a quarter of the length from the midpoint. Returns
/// `None` for text too short to split.
pub fn split_halves(text: &str) -> Option<(&str, &str)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = chars.len();
    if total < 2 {
        return None;
    }

    let mid = total / 2;
    let window = (total / 4).max(1);
    let lo = mid.saturating_sub(window).max(1);
    let hi = (mid + window).min(total - 1);

    let mut best: Option<(u8, usize, usize)> = None;
    for pos in lo..=hi {
        let Some(rank) = boundary_rank(&chars, pos) else {
            continue;
        };
        let dist = pos.abs_diff(mid);
        let better = match best {
            None => true,
            Some((r, d, _)) => rank > r || (rank == r && dist < d),
        };
        if better {
            best = Some((rank, dist, pos));
        }
    }

    let pos = best.map(|(_, _, p)| p).unwrap_or(mid);
    let byte = chars[pos].0;
    Some((&text[..byte], &text[byte..]))
}

/// Rank of the boundary that sits right before `chars[pos]`.
fn boundary_rank(chars: &[(usize, char)], pos: usize) -> Option<u8> {
    let prev = chars[pos - 1].1;
    let before_prev = pos.checked_sub(2).map(|i| chars[i].1);
    let next = chars[pos].1;

    if prev == '\n' {
        return Some(if before_prev == Some('\n') { 4 } else { 3 });
    }
    if matches!(prev, '。' | '！' | '？') {
        return Some(2);
    }
    if prev.is_whitespace() && !next.is_whitespace() {
        if matches!(before_prev, Some('.' | '!' | '?' | '"' | '”')) {
            return Some(2);
        }
        return Some(1);
    }
    None
}
