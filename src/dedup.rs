//! Collapses self-repeating model output ("Hello worldHello world").
//!
//! Two checks run on the trimmed text, in order:
//!
//! 1. Tiling: the shortest prefix `unit` (at most half the text) that, repeated
//!    and truncated to the text's length, reproduces the text exactly.
//!    Returns `unit` trimmed.
//! 2. Halves: for texts longer than [`HALVES_MIN_CHARS`], if the trimmed first
//!    half equals the trimmed second half, returns the first half.
//!
//! The pass is repeated until the text stops changing, so the transform is
//! idempotent. Lengths are counted in `char`s.
//!
//! Short legitimate repetition is collapsed too: `"haha"` becomes `"ha"`.

pub const HALVES_MIN_CHARS: usize = 50;

pub fn normalize(text: &str) -> String {
    let mut current = text.trim().to_string();
    loop {
        let next = collapse_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn collapse_once(text: &str) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let len = chars.len();

    for unit_len in 1..=len / 2 {
        let unit = &chars[..unit_len];
        if chars.iter().zip(unit.iter().cycle()).all(|(a, b)| a == b) {
            return unit.iter().collect::<String>().trim().to_string();
        }
    }

    if len > HALVES_MIN_CHARS {
        let (first, second) = chars.split_at(len / 2);
        let first: String = first.iter().collect();
        let second: String = second.iter().collect();
        if first.trim() == second.trim() {
            return first.trim().to_string();
        }
    }

    trimmed.to_string()
}
