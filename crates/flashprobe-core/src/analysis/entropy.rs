//! Byte statistics and per-chunk content classification.

use std::collections::BTreeMap;

use super::{Confidence, DetectedPattern, PatternType};

/// Compressor magics checked at the start of a chunk.
const COMPRESSION_MAGICS: &[(&[u8], &str)] = &[
    (&[0x1F, 0x8B], "gzip"),
    (&[0x78, 0x9C], "zlib"),
    (&[0x78, 0xDA], "zlib (best)"),
    (&[0x5D, 0x00, 0x00], "LZMA"),
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], "XZ"),
    (&[0x28, 0xB5, 0x2F, 0xFD], "Zstandard"),
    (&[0x04, 0x22, 0x4D, 0x18], "LZ4"),
];

const EXECUTABLE_MAGICS: &[(&[u8], &str)] = &[
    (b"\x7FELF", "ELF executable"),
    (&[0x27, 0x05, 0x19, 0x56], "U-Boot image header"),
];

/// Filesystem superblocks recognised at a chunk start.
const FILESYSTEM_MAGICS: &[(&[u8], &str)] = &[
    (b"hsqs", "SquashFS superblock"),
    (b"UBI#", "UBI erase counter header"),
    (b"UBI!", "UBI volume header"),
    (&[0x45, 0x3D, 0xCD, 0x28], "CramFS superblock"),
];

/// Shannon entropy in bits per byte, 0.0..=8.0.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// One bit short of 0xFF: a programmed bit in erased flash.
pub fn is_near_erased(b: u8) -> bool {
    b != 0xFF && (b | b.wrapping_add(1)) == 0xFF
}

/// One bit set in an otherwise zero byte.
pub fn is_near_zero(b: u8) -> bool {
    b.count_ones() == 1
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || matches!(b, 0x09 | 0x0A | 0x0D)
}

/// Ratios and entropy of one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteStats {
    pub entropy: f64,
    pub ff_ratio: f32,
    pub zero_ratio: f32,
    pub printable_ratio: f32,
    /// Share of non-0xFF bytes that are a single bit away from 0xFF.
    pub flipped_ratio: f32,
}

impl ByteStats {
    pub fn of(data: &[u8]) -> Self {
        let len = data.len().max(1) as f32;
        let ff = data.iter().filter(|&&b| b == 0xFF).count();
        let zero = data.iter().filter(|&&b| b == 0x00).count();
        let printable = data.iter().filter(|&&b| is_printable(b)).count();
        let flipped = data.iter().filter(|&&b| is_near_erased(b)).count();
        let not_ff = data.len() - ff;
        Self {
            entropy: shannon_entropy(data),
            ff_ratio: ff as f32 / len,
            zero_ratio: zero as f32 / len,
            printable_ratio: printable as f32 / len,
            flipped_ratio: if not_ff == 0 {
                0.0
            } else {
                flipped as f32 / not_ff as f32
            },
        }
    }
}

/// Shortest period of 2..=16 bytes that repeats over 90% of the chunk.
pub fn repeating_period(chunk: &[u8]) -> Option<(usize, f32)> {
    (2..=16).find_map(|period| {
        if chunk.len() < period * 4 {
            return None;
        }
        let unit = &chunk[..period];
        let windows = chunk.chunks_exact(period);
        let total = windows.len();
        let matches = windows.filter(|w| *w == unit).count();
        let ratio = matches as f32 / total as f32;
        (ratio > 0.9).then_some((period, ratio))
    })
}

fn magic_at_start<'a>(chunk: &[u8], table: &[(&[u8], &'a str)]) -> Option<&'a str> {
    table
        .iter()
        .find(|(magic, _)| chunk.starts_with(magic))
        .map(|(_, name)| *name)
}

fn pattern(
    pattern_type: PatternType,
    range: (usize, usize),
    confidence: Confidence,
    description: impl Into<String>,
) -> DetectedPattern {
    DetectedPattern {
        pattern_type,
        start_offset: range.0,
        end_offset: range.1,
        confidence,
        description: description.into(),
        details: BTreeMap::new(),
    }
}

/// Classify one chunk, or `None` for low-entropy data with no distinguishing feature.
pub fn classify_chunk(chunk: &[u8], offset: usize) -> Option<DetectedPattern> {
    if chunk.is_empty() {
        return None;
    }
    let range = (offset, offset + chunk.len());
    let stats = ByteStats::of(chunk);

    if stats.ff_ratio > 0.99 {
        return Some(pattern(
            PatternType::Empty,
            range,
            Confidence::VeryHigh,
            "Erased/empty region (0xFF)",
        ));
    }
    if stats.zero_ratio > 0.99 {
        return Some(pattern(
            PatternType::Zeroed,
            range,
            Confidence::VeryHigh,
            "Zero-filled region",
        ));
    }
    if stats.ff_ratio > 0.95 && stats.flipped_ratio >= 0.5 {
        let mut p = pattern(
            PatternType::Random,
            range,
            Confidence::from_score(stats.flipped_ratio),
            "Erased region with scattered bit flips",
        );
        p.details
            .insert("ff_ratio".into(), format!("{:.3}", stats.ff_ratio));
        return Some(p);
    }
    if let Some((period, ratio)) = repeating_period(chunk) {
        let mut p = pattern(
            PatternType::Repeating,
            range,
            Confidence::from_score(ratio),
            format!("Repeating {}-byte pattern", period),
        );
        p.details.insert("pattern_length".into(), period.to_string());
        p.details.insert(
            "pattern_hex".into(),
            chunk[..period]
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" "),
        );
        return Some(p);
    }
    if stats.printable_ratio > 0.85 {
        return Some(pattern(
            PatternType::Text,
            range,
            Confidence::from_score(stats.printable_ratio),
            "ASCII/text data region",
        ));
    }
    if let Some(format) = magic_at_start(chunk, COMPRESSION_MAGICS) {
        let mut p = pattern(
            PatternType::Compressed,
            range,
            Confidence::High,
            format!("{} compressed data", format),
        );
        p.details.insert("format".into(), format.to_string());
        return Some(p);
    }
    if let Some(kind) = magic_at_start(chunk, EXECUTABLE_MAGICS) {
        return Some(pattern(PatternType::Executable, range, Confidence::VeryHigh, kind));
    }
    if let Some(kind) = magic_at_start(chunk, FILESYSTEM_MAGICS) {
        return Some(pattern(PatternType::FilesystemMeta, range, Confidence::High, kind));
    }
    if stats.entropy > 7.5 {
        let mut p = pattern(
            PatternType::Encrypted,
            range,
            Confidence::from_score((stats.entropy - 7.0) as f32),
            "High-entropy data (likely encrypted)",
        );
        p.details
            .insert("entropy".into(), format!("{:.2}", stats.entropy));
        return Some(p);
    }
    if stats.entropy > 5.0 {
        return Some(pattern(
            PatternType::StructuredBinary,
            range,
            Confidence::Medium,
            "Structured binary data",
        ));
    }
    None
}

/// Classify `data` in chunks of four pages, merging adjacent chunks of the same type.
pub fn detect_patterns(data: &[u8], page_size: usize) -> Vec<DetectedPattern> {
    let chunk_size = page_size.max(1) * 4;
    let mut patterns: Vec<DetectedPattern> = Vec::new();

    for (i, chunk) in data.chunks(chunk_size).enumerate() {
        let offset = i * chunk_size;
        let Some(found) = classify_chunk(chunk, offset) else {
            continue;
        };
        if let Some(last) = patterns.last_mut()
            && last.pattern_type == found.pattern_type
            && last.end_offset == offset
        {
            last.end_offset = found.end_offset;
            continue;
        }
        patterns.push(found);
    }
    patterns
}

/// Entropy of each `block_bytes` slice.
pub fn block_entropies(data: &[u8], block_bytes: usize) -> Vec<f64> {
    data.chunks(block_bytes.max(1)).map(shannon_entropy).collect()
}
