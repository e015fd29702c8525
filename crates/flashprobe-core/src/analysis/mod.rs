//! Dump Analysis Module
//!
//! Turns a raw dump into findings: filesystem signatures, page statistics,
//! classified regions, anomalies, recovery suggestions and recommendations.
//! Every entry point is a pure function of the buffer and its geometry.

pub mod advice;
pub mod anomaly;
pub mod entropy;
pub mod signatures;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::chip::ChipInfo;
use crate::session::PageEcc;

/// Page and block geometry the buffer is read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: usize,
    pub pages_per_block: usize,
}

impl Geometry {
    pub fn new(page_size: usize, pages_per_block: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            pages_per_block: pages_per_block.max(1),
        }
    }

    pub fn block_bytes(&self) -> usize {
        self.page_size * self.pages_per_block
    }
}

/// Signature hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub name: String,
    pub offset: usize,
    pub confidence: f32,
}

/// Result of a basic analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub filesystem_type: Option<String>,
    pub signatures: Vec<Signature>,
    pub bad_blocks: BTreeSet<u64>,
    /// Pages that are entirely 0xFF or entirely 0x00.
    pub empty_pages: u64,
    pub data_pages: u64,
}

impl AnalysisResult {
    pub fn total_pages(&self) -> u64 {
        self.empty_pages + self.data_pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Confidence {
    pub fn from_score(score: f32) -> Self {
        match score {
            s if s >= 0.9 => Confidence::VeryHigh,
            s if s >= 0.7 => Confidence::High,
            s if s >= 0.5 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }

    pub fn to_score(self) -> f32 {
        match self {
            Confidence::VeryHigh => 0.95,
            Confidence::High => 0.8,
            Confidence::Medium => 0.6,
            Confidence::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    Encrypted,
    Compressed,
    Executable,
    Text,
    StructuredBinary,
    /// Erased flash (0xFF).
    Empty,
    Zeroed,
    Repeating,
    /// Erased flash damaged by bit flips.
    Random,
    FilesystemMeta,
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatternType::Encrypted => "Encrypted",
            PatternType::Compressed => "Compressed",
            PatternType::Executable => "Executable",
            PatternType::Text => "Text",
            PatternType::StructuredBinary => "Structured binary",
            PatternType::Empty => "Empty",
            PatternType::Zeroed => "Zeroed",
            PatternType::Repeating => "Repeating",
            PatternType::Random => "Random",
            PatternType::FilesystemMeta => "Filesystem metadata",
        };
        f.write_str(name)
    }
}

/// Classified region `[start_offset, end_offset)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    pub start_offset: usize,
    pub end_offset: usize,
    pub confidence: Confidence,
    pub description: String,
    pub details: BTreeMap<String, String>,
}

impl DetectedPattern {
    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered so that `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Critical => write!(f, "CRIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    BadBlocks,
    BitRot,
    Truncation,
    HeaderCorruption,
    PatternTransition,
    Fragmentation,
    EntropyDiscontinuity,
    EccFailure,
    ProtectionInconsistency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub location: Option<usize>,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySuggestion {
    /// 1 is most urgent.
    pub priority: u8,
    pub action: String,
    pub description: String,
    pub estimated_success: f32,
    pub affected_regions: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChipRecommendation {
    pub category: String,
    pub title: String,
    pub description: String,
    pub importance: u8,
}

/// Full analysis: classified regions, anomalies and advice.
#[derive(Debug, Clone, PartialEq)]
pub struct AiAnalysisResponse {
    pub patterns: Vec<DetectedPattern>,
    pub anomalies: Vec<Anomaly>,
    pub recovery_suggestions: Vec<RecoverySuggestion>,
    pub chip_recommendations: Vec<ChipRecommendation>,
    pub data_quality_score: f32,
    pub encryption_probability: f32,
    pub compression_probability: f32,
    pub summary: String,
}

/// Optional knowledge from the dump session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisContext<'a> {
    /// Per-page ECC outcomes, as returned in a dump report.
    pub page_ecc: &'a [PageEcc],
    /// Device page at buffer offset 0. `PageEcc::page` is relative to the chip.
    pub first_page: u64,
    pub chip: Option<&'a ChipInfo>,
}

/// Signatures, bad-block candidates and page statistics.
pub fn analyze(data: &[u8], page_size: usize, pages_per_block: usize) -> AnalysisResult {
    let geometry = Geometry::new(page_size, pages_per_block);
    let signatures = signatures::scan(data, geometry.page_size, geometry.block_bytes());
    let filesystem_type = signatures::filesystem_type(&signatures);

    let (empty, data_pages) = data.chunks(geometry.page_size).fold((0u64, 0u64), |(e, d), page| {
        let blank = page.iter().all(|&b| b == 0xFF) || page.iter().all(|&b| b == 0x00);
        if blank { (e + 1, d) } else { (e, d + 1) }
    });

    AnalysisResult {
        filesystem_type,
        signatures,
        bad_blocks: anomaly::bad_block_candidates(data, geometry),
        empty_pages: empty,
        data_pages,
    }
}

pub fn ai_analyze(data: &[u8], page_size: usize, pages_per_block: usize) -> AiAnalysisResponse {
    ai_analyze_with(data, page_size, pages_per_block, &AnalysisContext::default())
}

/// Like [`ai_analyze`], also using ECC outcomes and chip details.
pub fn ai_analyze_with(
    data: &[u8],
    page_size: usize,
    pages_per_block: usize,
    context: &AnalysisContext<'_>,
) -> AiAnalysisResponse {
    let geometry = Geometry::new(page_size, pages_per_block);
    let patterns = entropy::detect_patterns(data, geometry.page_size);
    let anomalies = anomaly::detect(data, geometry, &patterns, context);
    let recovery_suggestions = advice::recovery_suggestions(data, geometry, &anomalies, context);
    let chip_recommendations = advice::chip_recommendations(data, geometry, &patterns, context);

    let data_quality_score = advice::data_quality(data, &anomalies);
    let encryption_probability = advice::probability(&patterns, PatternType::Encrypted);
    let compression_probability = advice::probability(&patterns, PatternType::Compressed);
    let summary = advice::summary(&patterns, &anomalies, data_quality_score, encryption_probability);

    AiAnalysisResponse {
        patterns,
        anomalies,
        recovery_suggestions,
        chip_recommendations,
        data_quality_score,
        encryption_probability,
        compression_probability,
        summary,
    }
}

impl AnalysisResult {
    /// Format as text for display
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Filesystem: {}\n",
            self.filesystem_type.as_deref().unwrap_or("none detected")
        ));
        out.push_str(&format!(
            "Pages: {} total, {} empty, {} with data\n",
            self.total_pages(),
            self.empty_pages,
            self.data_pages
        ));
        if !self.bad_blocks.is_empty() {
            let list: Vec<String> = self.bad_blocks.iter().map(|b| b.to_string()).collect();
            out.push_str(&format!("Bad block candidates: {}\n", list.join(", ")));
        }
        if !self.signatures.is_empty() {
            out.push_str("\nSignatures:\n");
            for s in &self.signatures {
                out.push_str(&format!(
                    "  0x{:08X}  {:<14} {:.0}%\n",
                    s.offset,
                    s.name,
                    s.confidence * 100.0
                ));
            }
        }
        out
    }
}

impl AiAnalysisResponse {
    /// Format as text for display
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n", self.summary));
        out.push_str(&format!(
            "Encryption: {:.0}%  Compression: {:.0}%\n",
            self.encryption_probability * 100.0,
            self.compression_probability * 100.0
        ));

        if !self.patterns.is_empty() {
            out.push_str("\nRegions:\n");
            for p in &self.patterns {
                out.push_str(&format!(
                    "  0x{:08X}-0x{:08X}  {:<20} {:?}  {}\n",
                    p.start_offset,
                    p.end_offset,
                    p.pattern_type.to_string(),
                    p.confidence,
                    p.description
                ));
            }
        }
        if !self.anomalies.is_empty() {
            out.push_str("\nAnomalies:\n");
            for a in &self.anomalies {
                let at = a.location.map(|l| format!(" @0x{:X}", l)).unwrap_or_default();
                out.push_str(&format!("  [{}]{} {}\n", a.severity, at, a.description));
                out.push_str(&format!("         {}\n", a.recommendation));
            }
        }
        if !self.recovery_suggestions.is_empty() {
            out.push_str("\nRecovery:\n");
            for s in &self.recovery_suggestions {
                out.push_str(&format!(
                    "  P{} {} ({:.0}%): {}\n",
                    s.priority,
                    s.action,
                    s.estimated_success * 100.0,
                    s.description
                ));
            }
        }
        if !self.chip_recommendations.is_empty() {
            out.push_str("\nRecommendations:\n");
            for r in &self.chip_recommendations {
                out.push_str(&format!("  [{}] {}: {}\n", r.category, r.title, r.description));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::EccStatus;

    fn noise(len: usize) -> Vec<u8> {
        let mut x = 0x2545_F491u32;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_all_zero_block() {
        let data = vec![0u8; 2048 * 64];
        let result = analyze(&data, 2048, 64);
        assert_eq!(result.empty_pages, 64);
        assert_eq!(result.data_pages, 0);
        assert!(result.bad_blocks.is_empty());

        let ai = ai_analyze(&data, 2048, 64);
        assert_eq!(ai.patterns.len(), 1);
        assert_eq!(ai.patterns[0].pattern_type, PatternType::Zeroed);
        assert_eq!(ai.patterns[0].end_offset, data.len());
    }

    #[test]
    fn test_squashfs_signature() {
        let mut data = vec![0u8; 2048 * 64];
        data[..4].copy_from_slice(b"hsqs");
        let result = analyze(&data, 2048, 64);
        let sig = &result.signatures[0];
        assert_eq!((sig.name.as_str(), sig.offset), ("SquashFS", 0));
        assert!(sig.confidence > 0.5);
        assert_eq!(result.filesystem_type.as_deref(), Some("SquashFS"));
        assert_eq!(result.data_pages, 1);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let mut data = noise(2048 * 32);
        data.extend(vec![0xFF; 2048 * 32]);
        data[..4].copy_from_slice(b"UBI#");
        assert_eq!(analyze(&data, 2048, 64), analyze(&data, 2048, 64));
        assert_eq!(ai_analyze(&data, 2048, 64), ai_analyze(&data, 2048, 64));
    }

    #[test]
    fn test_scores_in_range_and_patterns_ordered() {
        let mut data = noise(2048 * 16);
        data.extend(vec![0xFF; 2048 * 8]);
        data.extend(b"root:x:0:0:root:/root:/bin/sh\n".iter().cycle().take(2048 * 8));
        data.truncate(data.len() - 100);
        let ai = ai_analyze(&data, 2048, 64);

        for score in [ai.data_quality_score, ai.encryption_probability, ai.compression_probability] {
            assert!((0.0..=1.0).contains(&score));
        }
        assert!(ai.patterns.iter().all(|p| p.end_offset > p.start_offset));
        assert!(ai.patterns.windows(2).all(|w| w[0].end_offset <= w[1].start_offset));
        assert!(ai.encryption_probability > 0.4);
        assert!(ai.anomalies.iter().any(|a| a.kind == AnomalyKind::Truncation));
    }

    #[test]
    fn test_context_feeds_ecc_anomalies() {
        let data = vec![0xA5u8; 2048 * 64];
        let page_ecc = [
            PageEcc {
                page: 10,
                status: EccStatus::Uncorrectable,
            },
            PageEcc {
                page: 11,
                status: EccStatus::Uncorrectable,
            },
        ];
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            ..Default::default()
        };
        let ai = ai_analyze_with(&data, 2048, 64, &context);
        assert_eq!(ai.anomalies[0].kind, AnomalyKind::EccFailure);
        assert_eq!(ai.anomalies[0].severity, Severity::Critical);
        assert_eq!(ai.recovery_suggestions[0].action, "Re-read With Slower Timing");
        assert!(ai.recovery_suggestions.iter().all(|s| s.action != "Apply ECC Correction"));
    }

    #[test]
    fn test_zero_geometry_does_not_panic() {
        let result = analyze(&[1, 2, 3], 0, 0);
        assert_eq!(result.data_pages, 3);
        let _ = ai_analyze(&[], 0, 0);
    }
}
