//! Recovery suggestions, chip recommendations, scores and the summary line.

use super::anomaly;
use super::entropy::shannon_entropy;
use super::{
    Anomaly, AnomalyKind, AnalysisContext, ChipRecommendation, DetectedPattern, Geometry, PatternType,
    RecoverySuggestion, Severity,
};
use crate::chip::{FlashInterface, UfsLunType};

const PAGE_SIZE_CANDIDATES: [usize; 5] = [512, 2048, 4096, 8192, 16384];

/// Uncorrectable page density above which the ECC layout itself is suspect.
const ECC_MISMATCH_DENSITY: f32 = 0.5;
/// Consecutive bad-block candidates that point at a wrong chip profile.
const PROFILE_CLUSTER_BLOCKS: usize = 8;

/// Inclusive runs of consecutive values in an ascending sequence.
fn runs(values: impl IntoIterator<Item = u64>) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == value => *end = value,
            _ => runs.push((value, value)),
        }
    }
    runs
}

fn longest(runs: &[(u64, u64)]) -> usize {
    runs.iter().map(|(start, end)| (end - start + 1) as usize).max().unwrap_or(0)
}

fn suggestion(
    priority: u8,
    action: &str,
    description: String,
    success: f32,
    regions: Vec<(usize, usize)>,
) -> RecoverySuggestion {
    RecoverySuggestion {
        priority,
        action: action.into(),
        description,
        estimated_success: success.clamp(0.0, 1.0),
        affected_regions: regions,
    }
}

/// Uncorrectable pages: isolated failures are usually marginal reads, dense
/// ones a mismatched ECC layout, clustered ones worn blocks.
fn ecc_suggestions(
    data: &[u8],
    geometry: Geometry,
    context: &AnalysisContext<'_>,
    out: &mut Vec<RecoverySuggestion>,
) {
    let total_pages = data.len().div_ceil(geometry.page_size) as u64;
    let failed: Vec<u64> = context
        .page_ecc
        .iter()
        .filter(|p| p.status.is_uncorrectable())
        .filter_map(|p| p.page.checked_sub(context.first_page))
        .filter(|&page| page < total_pages)
        .collect();
    if failed.is_empty() {
        return;
    }

    let density = failed.len() as f32 / total_pages as f32;
    let failed_runs = runs(failed.iter().copied());
    let clustered = longest(&failed_runs) >= (geometry.pages_per_block / 4).max(2);
    let regions: Vec<(usize, usize)> = failed_runs
        .iter()
        .map(|&(start, end)| {
            let from = start as usize * geometry.page_size;
            let to = ((end + 1) as usize * geometry.page_size).min(data.len());
            (from, to)
        })
        .collect();

    let mut reread = 0.8 * (1.0 - density).powi(2);
    if clustered {
        reread *= 0.5;
    }
    out.push(suggestion(
        if density < 0.05 && !clustered { 1 } else { 3 },
        "Re-read With Slower Timing",
        format!(
            "{} pages ({:.1}%) failed ECC. Re-read them with a lower clock and longer read delays.",
            failed.len(),
            density * 100.0
        ),
        reread,
        regions.clone(),
    ));

    if density >= ECC_MISMATCH_DENSITY {
        out.push(suggestion(
            1,
            "Try Alternate ECC Mode",
            "Most pages fail ECC, so the configured scheme or spare layout likely does not match the chip.".into(),
            0.75,
            vec![(0, data.len())],
        ));
    } else {
        out.push(suggestion(
            2,
            "Try Alternate ECC Mode",
            "Decode the failing pages with a stronger BCH strength or another codeword size.".into(),
            0.3 + 0.4 * density,
            regions.clone(),
        ));
    }

    if clustered {
        out.push(suggestion(
            2,
            "Skip Failing Blocks",
            format!(
                "Up to {} consecutive pages are unreadable. Treat their blocks as bad and rebuild around them.",
                longest(&failed_runs)
            ),
            0.6,
            regions,
        ));
    }
}

/// Bad-block markers: a few are normal wear, a long run usually means the
/// markers are read at the wrong offsets.
fn bad_block_suggestions(data: &[u8], geometry: Geometry, out: &mut Vec<RecoverySuggestion>) {
    let bad = anomaly::bad_block_candidates(data, geometry);
    if bad.is_empty() {
        return;
    }
    let total_blocks = data.len().div_ceil(geometry.block_bytes()).max(1);
    let fraction = bad.len() as f32 / total_blocks as f32;
    let cluster = longest(&runs(bad.iter().copied()));

    out.push(suggestion(
        2,
        "Skip Bad Blocks",
        format!(
            "Rebuild the image by skipping {} marked bad blocks and shifting offsets.",
            bad.len()
        ),
        0.9 * (1.0 - fraction) / (1.0 + 0.1 * (cluster - 1) as f32),
        Vec::new(),
    ));

    if cluster >= PROFILE_CLUSTER_BLOCKS || fraction > 0.25 {
        out.push(suggestion(
            if fraction > 0.5 { 1 } else { 2 },
            "Attempt Different Chip Profile",
            format!(
                "{} consecutive blocks look bad. A wrong page size or spare layout misplaces bad-block markers.",
                cluster
            ),
            (0.3 + 0.5 * fraction).min(0.8),
            vec![(0, data.len())],
        ));
    }
}

/// Remediation actions, most urgent first and most promising first within a
/// priority.
pub fn recovery_suggestions(
    data: &[u8],
    geometry: Geometry,
    anomalies: &[Anomaly],
    context: &AnalysisContext<'_>,
) -> Vec<RecoverySuggestion> {
    let has = |kind: AnomalyKind| anomalies.iter().any(|a| a.kind == kind);
    let mut suggestions = Vec::new();

    ecc_suggestions(data, geometry, context, &mut suggestions);
    if has(AnomalyKind::BitRot) && context.page_ecc.is_empty() {
        suggestions.push(suggestion(
            1,
            "Apply ECC Correction",
            "The dump was read raw. Use BCH or Hamming ECC to correct bit errors in affected pages.".into(),
            0.85,
            vec![(0, data.len())],
        ));
    }
    bad_block_suggestions(data, geometry, &mut suggestions);
    if has(AnomalyKind::Truncation) {
        suggestions.push(suggestion(
            1,
            "Re-dump Chip",
            "Take a fresh dump over a stable connection and let the read complete.".into(),
            0.95,
            vec![(data.len().saturating_sub(geometry.page_size), data.len())],
        ));
    }
    if shannon_entropy(data) > 7.0 {
        suggestions.push(suggestion(
            3,
            "Identify Encryption",
            "High entropy suggests encryption. Identify the scheme and locate the keys.".into(),
            0.30,
            vec![(0, data.len())],
        ));
    }

    suggestions.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.estimated_success.total_cmp(&a.estimated_success))
    });
    suggestions
}

/// Share of page-aligned offsets that start with a header or an erased page.
fn alignment_score(data: &[u8], size: usize) -> Option<f32> {
    if data.len() < size * 4 {
        return None;
    }
    let mut hits = 0usize;
    let mut samples = 0usize;
    for offset in (0..data.len()).step_by(size) {
        let Some(head) = data.get(offset..offset + 16) else {
            break;
        };
        let marker = head.starts_with(&[0x27, 0x05, 0x19, 0x56])
            || head.starts_with(b"hsqs")
            || head.starts_with(b"\x7FELF")
            || head.iter().all(|&b| b == 0xFF);
        hits += marker as usize;
        samples += 1;
    }
    (samples > 0).then(|| hits as f32 / samples as f32)
}

/// Page size the data layout suggests; the configured size wins ties.
pub fn likely_page_size(data: &[u8], page_size: usize) -> usize {
    let mut best = page_size;
    let mut best_score = alignment_score(data, page_size).unwrap_or(0.0);
    for size in PAGE_SIZE_CANDIDATES {
        if let Some(score) = alignment_score(data, size)
            && score > best_score
        {
            best = size;
            best_score = score;
        }
    }
    best
}

fn recommendation(category: &str, title: &str, description: String, importance: u8) -> ChipRecommendation {
    ChipRecommendation {
        category: category.into(),
        title: title.into(),
        description,
        importance,
    }
}

pub fn chip_recommendations(
    data: &[u8],
    geometry: Geometry,
    patterns: &[DetectedPattern],
    context: &AnalysisContext<'_>,
) -> Vec<ChipRecommendation> {
    let mut out = Vec::new();

    let detected = likely_page_size(data, geometry.page_size);
    if detected != geometry.page_size {
        out.push(recommendation(
            "Configuration",
            "Page Size Mismatch",
            format!(
                "Data layout suggests {}-byte pages, but {} is configured.",
                detected, geometry.page_size
            ),
            8,
        ));
    }
    if patterns.iter().any(|p| p.pattern_type == PatternType::Random) {
        out.push(recommendation(
            "ECC",
            "Enable ECC Correction",
            "Data shows bit errors. Enable BCH-8 or BCH-16 for better recovery.".into(),
            9,
        ));
    }
    let empty_bytes: usize = patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::Empty)
        .map(DetectedPattern::len)
        .sum();
    if !data.is_empty() && empty_bytes as f32 / data.len() as f32 > 0.8 {
        out.push(recommendation(
            "Timing",
            "Verify Read Timing",
            "Large empty regions. Check timing parameters and retry at a slower read speed.".into(),
            7,
        ));
    }
    if patterns
        .iter()
        .any(|p| matches!(p.pattern_type, PatternType::Compressed | PatternType::Executable))
    {
        out.push(recommendation(
            "Analysis",
            "Extract Filesystem",
            "Compressed or executable data found. Use binwalk or similar to extract it.".into(),
            6,
        ));
    }

    if let Some(chip) = context.chip {
        if !chip.resolved {
            out.push(recommendation(
                "Identification",
                "Unknown Chip",
                format!(
                    "ID {} is not in the database; conservative geometry is in use.",
                    chip.id_hex()
                ),
                10,
            ));
        }
        if chip.voltage.as_deref().is_some_and(|v| v.contains("1.8")) {
            out.push(recommendation(
                "Electrical",
                "1.8 V Part",
                "Make sure the programmer drives 1.8 V I/O; 3.3 V can damage the chip.".into(),
                10,
            ));
        }
        if let Some(bits) = chip.ecc_bits.filter(|&b| b > 1) {
            out.push(recommendation(
                "ECC",
                "Required ECC Strength",
                format!("Vendor requires {}-bit correction per 512 bytes; use BCH-{}.", bits, bits),
                9,
            ));
        }
        if chip.protection.is_some_and(|p| p.any()) {
            out.push(recommendation(
                "Protection",
                "Block Protection Active",
                "Part of the array is write protected. Unlock before erase or write.".into(),
                8,
            ));
        }
        if chip.interface == FlashInterface::SpiNor && chip.supports_qspi == Some(true) {
            out.push(recommendation(
                "Performance",
                "Quad SPI Available",
                "Chip supports QSPI reads; enable quad mode for faster dumps.".into(),
                5,
            ));
        }
        if let Some(mhz) = chip.max_clock_mhz.filter(|&m| m > 50) {
            out.push(recommendation(
                "Timing",
                "High Clock Rating",
                format!("Rated up to {} MHz; lower the clock if reads are unstable.", mhz),
                4,
            ));
        }
        if chip
            .luns
            .iter()
            .any(|l| l.lun_type == UfsLunType::Rpmb && l.enabled)
        {
            out.push(recommendation(
                "Security",
                "RPMB Present",
                "RPMB is authenticated storage and is never the default dump target.".into(),
                3,
            ));
        }
    }

    out.sort_by(|a, b| b.importance.cmp(&a.importance));
    out
}

pub fn data_quality(data: &[u8], anomalies: &[Anomaly]) -> f32 {
    let mut score = 1.0f32;
    for anomaly in anomalies {
        score -= match anomaly.severity {
            Severity::Critical => 0.3,
            Severity::Warning => 0.1,
            Severity::Info => 0.02,
        };
    }
    if !data.is_empty() {
        let ff = data.iter().filter(|&&b| b == 0xFF).count() as f32 / data.len() as f32;
        if ff > 0.9 {
            score -= 0.2;
        }
    }
    score.clamp(0.0, 1.0)
}

/// Share of non-blank bytes that fall in patterns of `kind`.
pub fn probability(patterns: &[DetectedPattern], kind: PatternType) -> f32 {
    let data_bytes: usize = patterns
        .iter()
        .filter(|p| !matches!(p.pattern_type, PatternType::Empty | PatternType::Zeroed))
        .map(DetectedPattern::len)
        .sum();
    if data_bytes == 0 {
        return 0.0;
    }
    let kind_bytes: usize = patterns
        .iter()
        .filter(|p| p.pattern_type == kind)
        .map(DetectedPattern::len)
        .sum();
    (kind_bytes as f32 / data_bytes as f32).min(1.0)
}

pub fn summary(patterns: &[DetectedPattern], anomalies: &[Anomaly], quality: f32, encryption: f32) -> String {
    let mut parts = Vec::new();
    let grade = match quality {
        q if q >= 0.9 => "excellent",
        q if q >= 0.7 => "good",
        q if q >= 0.5 => "fair",
        _ => "poor",
    };
    parts.push(format!("Data quality: {} ({:.0}%)", grade, quality * 100.0));

    let found: Vec<String> = [
        (PatternType::Encrypted, "encrypted"),
        (PatternType::Compressed, "compressed"),
        (PatternType::Executable, "executable"),
        (PatternType::Text, "text"),
    ]
    .iter()
    .filter_map(|(kind, label)| {
        let n = patterns.iter().filter(|p| p.pattern_type == *kind).count();
        (n > 0).then(|| format!("{} {}", n, label))
    })
    .collect();
    if !found.is_empty() {
        parts.push(format!("Found: {}", found.join(", ")));
    }

    if encryption > 0.5 {
        parts.push(format!("{:.0}% likely encrypted", encryption * 100.0));
    }
    let critical = anomalies.iter().filter(|a| a.severity == Severity::Critical).count();
    let warnings = anomalies.iter().filter(|a| a.severity == Severity::Warning).count();
    if critical > 0 {
        parts.push(format!("{} critical issues", critical));
    }
    if warnings > 0 {
        parts.push(format!("{} warnings", warnings));
    }
    parts.join(". ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChipInfo, ProtectionBits};
    use crate::ecc::EccStatus;
    use crate::session::PageEcc;

    const GEO: Geometry = Geometry {
        page_size: 2048,
        pages_per_block: 64,
    };

    fn anomaly(kind: AnomalyKind, severity: Severity) -> Anomaly {
        Anomaly {
            kind,
            severity,
            location: None,
            description: String::new(),
            recommendation: String::new(),
        }
    }

    fn uncorrectable(pages: impl IntoIterator<Item = u64>) -> Vec<PageEcc> {
        pages
            .into_iter()
            .map(|page| PageEcc {
                page,
                status: EccStatus::Uncorrectable,
            })
            .collect()
    }

    /// Erased blocks, with `bad` ones carrying a factory marker.
    fn marked_blocks(blocks: usize, bad: impl IntoIterator<Item = usize>) -> Vec<u8> {
        let mut data = vec![0xFF; blocks * GEO.block_bytes()];
        for block in bad {
            data[block * GEO.block_bytes()] = 0x00;
            data[block * GEO.block_bytes() + GEO.page_size] = 0x00;
        }
        data
    }

    fn find<'a>(suggestions: &'a [RecoverySuggestion], action: &str) -> Option<&'a RecoverySuggestion> {
        suggestions.iter().find(|s| s.action == action)
    }

    #[test]
    fn test_recovery_priorities() {
        let anomalies = [anomaly(AnomalyKind::BitRot, Severity::Warning)];
        let data = marked_blocks(16, [3]);
        let suggestions = recovery_suggestions(&data, GEO, &anomalies, &AnalysisContext::default());
        let actions: Vec<&str> = suggestions.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, ["Apply ECC Correction", "Skip Bad Blocks"]);
    }

    #[test]
    fn test_sparse_ecc_failures_favour_reread() {
        let data = vec![0xA5; 256 * GEO.page_size];
        let page_ecc = uncorrectable([5, 90]);
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            ..Default::default()
        };
        let suggestions = recovery_suggestions(&data, GEO, &[], &context);
        assert_eq!(suggestions[0].action, "Re-read With Slower Timing");
        assert!(suggestions[0].estimated_success > 0.7);
        assert_eq!(suggestions[0].affected_regions[0], (5 * 2048, 6 * 2048));
        assert_eq!(find(&suggestions, "Try Alternate ECC Mode").unwrap().priority, 2);
        assert!(find(&suggestions, "Apply ECC Correction").is_none());
    }

    #[test]
    fn test_dense_ecc_failures_favour_alternate_ecc() {
        let data = vec![0xA5; 256 * GEO.page_size];
        let page_ecc = uncorrectable(0..200);
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            ..Default::default()
        };
        let suggestions = recovery_suggestions(&data, GEO, &[], &context);
        assert_eq!(suggestions[0].action, "Try Alternate ECC Mode");
        assert_eq!(suggestions[0].priority, 1);
        let reread = find(&suggestions, "Re-read With Slower Timing").unwrap();
        assert!(reread.estimated_success < 0.1);
        assert_eq!(reread.priority, 3);
        assert!(find(&suggestions, "Skip Failing Blocks").is_some());
    }

    #[test]
    fn test_ecc_pages_outside_buffer_are_ignored() {
        let data = vec![0xA5; 64 * GEO.page_size];
        let page_ecc = uncorrectable([10, 500]);
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            first_page: 64,
            chip: None,
        };
        assert!(recovery_suggestions(&data, GEO, &[], &context).is_empty());
    }

    #[test]
    fn test_bad_block_cluster_lowers_skip_estimate() {
        let scattered = recovery_suggestions(&marked_blocks(16, [3]), GEO, &[], &AnalysisContext::default());
        let clustered = recovery_suggestions(&marked_blocks(16, 2..12), GEO, &[], &AnalysisContext::default());

        let skip_one = find(&scattered, "Skip Bad Blocks").unwrap().estimated_success;
        let skip_run = find(&clustered, "Skip Bad Blocks").unwrap().estimated_success;
        assert!(skip_run < skip_one);
        assert!(find(&scattered, "Attempt Different Chip Profile").is_none());

        let profile = find(&clustered, "Attempt Different Chip Profile").unwrap();
        assert_eq!(profile.priority, 1);
        assert_eq!(clustered[0].action, "Attempt Different Chip Profile");
    }

    #[test]
    fn test_quality_score_clamped() {
        let anomalies: Vec<Anomaly> = (0..5).map(|_| anomaly(AnomalyKind::Truncation, Severity::Critical)).collect();
        assert_eq!(data_quality(&[0u8; 16], &anomalies), 0.0);
        assert_eq!(data_quality(&[0u8; 16], &[]), 1.0);
        assert!((data_quality(&[0xFF; 16], &[]) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_page_size_tie_keeps_configured() {
        assert_eq!(likely_page_size(&vec![0xFF; 65536], 2048), 2048);
        let mut data = vec![0u8; 65536];
        for offset in (0..data.len()).step_by(4096) {
            data[offset..offset + 4].copy_from_slice(b"hsqs");
        }
        assert_eq!(likely_page_size(&data, 2048), 4096);
    }

    #[test]
    fn test_chip_recommendations_sorted() {
        let mut chip = ChipInfo::unknown(FlashInterface::SpiNor, &[0xAB, 0xCD, 0xEF]);
        chip.protection = Some(ProtectionBits::from_status(0x1C, 0x00));
        chip.supports_qspi = Some(true);
        let context = AnalysisContext {
            chip: Some(&chip),
            ..Default::default()
        };
        let recs = chip_recommendations(&[0u8; 8192], GEO, &[], &context);
        let titles: Vec<&str> = recs.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["Unknown Chip", "Block Protection Active", "Quad SPI Available"]);
    }

    #[test]
    fn test_summary_text() {
        let text = summary(&[], &[anomaly(AnomalyKind::BitRot, Severity::Warning)], 0.9, 0.0);
        assert_eq!(text, "Data quality: excellent (90%). 1 warnings");
    }
}
