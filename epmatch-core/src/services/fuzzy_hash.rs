//! Context-triggered piecewise hashing (ssdeep-compatible layout)
//!
//! A rolling checksum over a 7-byte window declares a chunk boundary whenever
//! it hits `block_size - 1` modulo the block size. Each chunk contributes one
//! base64 character (the low 6 bits of an FNV-style hash of the chunk), so the
//! digest stays around 64 characters no matter how long the input is.
//!
//! Digest format: `block_size:sig1:sig2`, where `sig2` is computed with twice
//! the block size. Two digests are comparable when their block sizes are equal
//! or differ by a factor of two.

use std::collections::HashSet;

const ROLLING_WINDOW: usize = 7;
const MIN_BLOCKSIZE: u32 = 3;
const SPAMSUM_LENGTH: usize = 64;
const HASH_PRIME: u32 = 0x0100_0193;
const HASH_INIT: u32 = 0x2802_1967;

const B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Runs longer than this carry no extra information and are collapsed
const MAX_RUN: usize = 3;

#[derive(Default)]
struct RollingHash {
    window: [u8; ROLLING_WINDOW],
    h1: u32,
    h2: u32,
    h3: u32,
    n: usize,
}

impl RollingHash {
    fn update(&mut self, c: u8) {
        let slot = self.n % ROLLING_WINDOW;

        self.h2 = self.h2.wrapping_sub(self.h1);
        self.h2 = self
            .h2
            .wrapping_add((ROLLING_WINDOW as u32).wrapping_mul(u32::from(c)));

        self.h1 = self.h1.wrapping_add(u32::from(c));
        self.h1 = self.h1.wrapping_sub(u32::from(self.window[slot]));

        self.window[slot] = c;
        self.n = self.n.wrapping_add(1);

        self.h3 = (self.h3 << 5) ^ u32::from(c);
    }

    fn sum(&self) -> u32 {
        self.h1.wrapping_add(self.h2).wrapping_add(self.h3)
    }
}

#[inline]
fn sum_hash(c: u8, h: u32) -> u32 {
    h.wrapping_mul(HASH_PRIME) ^ u32::from(c)
}

#[inline]
fn b64(h: u32) -> u8 {
    B64[(h % 64) as usize]
}

/// Compute the CTPH digest of a text
pub fn hash(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut block_size = MIN_BLOCKSIZE;
    while (block_size as usize).saturating_mul(SPAMSUM_LENGTH) < data.len() {
        block_size = block_size.saturating_mul(2);
    }

    loop {
        let (sig1, sig2) = digest_with_block_size(data, block_size);

        // Too few boundaries at this size: halve and rescan
        if block_size > MIN_BLOCKSIZE && sig1.len() < SPAMSUM_LENGTH / 2 {
            block_size /= 2;
            continue;
        }

        return format!(
            "{}:{}:{}",
            block_size,
            String::from_utf8_lossy(&sig1),
            String::from_utf8_lossy(&sig2)
        );
    }
}

fn digest_with_block_size(data: &[u8], block_size: u32) -> (Vec<u8>, Vec<u8>) {
    let mut roll = RollingHash::default();
    let mut h1 = HASH_INIT;
    let mut h2 = HASH_INIT;
    let mut sig1 = Vec::with_capacity(SPAMSUM_LENGTH);
    let mut sig2 = Vec::with_capacity(SPAMSUM_LENGTH / 2);
    let double = block_size.saturating_mul(2);

    for &c in data {
        h1 = sum_hash(c, h1);
        h2 = sum_hash(c, h2);
        roll.update(c);
        let r = roll.sum();

        if r % block_size == block_size - 1 {
            // A full signature keeps folding the tail into its last character
            if sig1.len() < SPAMSUM_LENGTH - 1 {
                sig1.push(b64(h1));
                h1 = HASH_INIT;
            }
            if r % double == double - 1 && sig2.len() < SPAMSUM_LENGTH / 2 - 1 {
                sig2.push(b64(h2));
                h2 = HASH_INIT;
            }
        }
    }

    if roll.sum() != 0 {
        sig1.push(b64(h1));
        sig2.push(b64(h2));
    }

    (sig1, sig2)
}

/// Parsed digest ready for repeated comparison
///
/// Parsing collapses character runs once so a corpus scan does not redo it
/// for every pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyDigest {
    block_size: u32,
    sig1: Vec<u8>,
    sig2: Vec<u8>,
}

impl FuzzyDigest {
    /// Parse `block_size:sig1:sig2`; `None` for malformed digests
    pub fn parse(digest: &str) -> Option<Self> {
        let mut parts = digest.splitn(3, ':');
        let block_size: u32 = parts.next()?.parse().ok()?;
        let sig1 = parts.next()?;
        let sig2 = parts.next()?;

        if block_size < MIN_BLOCKSIZE {
            return None;
        }

        Some(Self {
            block_size,
            sig1: eliminate_runs(sig1.as_bytes()),
            sig2: eliminate_runs(sig2.as_bytes()),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Similarity 0-100
    pub fn similarity(&self, other: &FuzzyDigest) -> u8 {
        let (bs1, bs2) = (self.block_size, other.block_size);

        if bs1 != bs2 && bs1 != bs2.saturating_mul(2) && bs2 != bs1.saturating_mul(2) {
            return 0;
        }

        if bs1 == bs2 && self.sig1 == other.sig1 {
            return 100;
        }

        let score = if bs1 == bs2 {
            score_strings(&self.sig1, &other.sig1, bs1)
                .max(score_strings(&self.sig2, &other.sig2, bs1.saturating_mul(2)))
        } else if bs1 == bs2.saturating_mul(2) {
            score_strings(&self.sig1, &other.sig2, bs1)
        } else {
            score_strings(&self.sig2, &other.sig1, bs2)
        };

        score as u8
    }
}

/// Compare two digest strings, 0-100
///
/// Symmetric; malformed digests score 0.
pub fn compare(a: &str, b: &str) -> u8 {
    match (FuzzyDigest::parse(a), FuzzyDigest::parse(b)) {
        (Some(da), Some(db)) => da.similarity(&db),
        _ => 0,
    }
}

fn eliminate_runs(sig: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sig.len());
    for (i, &c) in sig.iter().enumerate() {
        if i >= MAX_RUN && sig[i - 1] == c && sig[i - 2] == c && sig[i - 3] == c {
            continue;
        }
        out.push(c);
    }
    out
}

/// Unrelated signatures must share a window-length substring to score at all
fn has_common_substring(s1: &[u8], s2: &[u8]) -> bool {
    if s1.len() < ROLLING_WINDOW || s2.len() < ROLLING_WINDOW {
        return false;
    }
    let windows: HashSet<&[u8]> = s1.windows(ROLLING_WINDOW).collect();
    s2.windows(ROLLING_WINDOW).any(|w| windows.contains(w))
}

/// Weighted edit distance: insert/delete cost 1, substitution cost 2
fn edit_distance(s1: &[u8], s2: &[u8]) -> usize {
    let mut prev: Vec<usize> = (0..=s2.len()).collect();
    let mut curr = vec![0usize; s2.len() + 1];

    for (i, &a) in s1.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &b) in s2.iter().enumerate() {
            let substitution = prev[j] + if a == b { 0 } else { 2 };
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[s2.len()]
}

fn score_strings(s1: &[u8], s2: &[u8], block_size: u32) -> u32 {
    if s1.len() > SPAMSUM_LENGTH || s2.len() > SPAMSUM_LENGTH {
        return 0;
    }
    if !has_common_substring(s1, s2) {
        return 0;
    }

    let total_len = s1.len() + s2.len();
    let distance = edit_distance(s1, s2);

    // Scale to 0-100 with the same integer steps as the reference tool
    let scaled = (distance * SPAMSUM_LENGTH / total_len) as u32;
    let scaled = 100 * scaled / SPAMSUM_LENGTH as u32;
    if scaled >= 100 {
        return 0;
    }
    let score = 100 - scaled;

    // Small block sizes cannot justify high scores on short signatures
    let cap_threshold = (99 + ROLLING_WINDOW as u32) / ROLLING_WINDOW as u32 * MIN_BLOCKSIZE;
    if block_size >= cap_threshold {
        return score;
    }
    let cap = block_size / MIN_BLOCKSIZE * s1.len().min(s2.len()) as u32;
    score.min(cap)
}
