//! Anomaly detection over a dump and its classified patterns.

use std::collections::BTreeSet;

use super::entropy::{block_entropies, is_near_erased, is_near_zero, shannon_entropy};
use super::{Anomaly, AnomalyKind, AnalysisContext, DetectedPattern, Geometry, PatternType, Severity};

/// Bit-flip bytes per page above which the page is suspicious.
const BIT_ROT_BYTES_PER_PAGE: usize = 10;
/// Entropy step between neighbouring data blocks worth reporting.
const ENTROPY_STEP: f64 = 3.0;

/// Blocks whose first two pages both start with a non-0xFF marker byte.
///
/// Uniform blocks (all zero, all one value) are data, not markers.
pub fn bad_block_candidates(data: &[u8], geometry: Geometry) -> BTreeSet<u64> {
    data.chunks(geometry.block_bytes())
        .enumerate()
        .filter(|(_, block)| {
            block.len() > geometry.page_size
                && block[0] != 0xFF
                && block[geometry.page_size] != 0xFF
                && block.iter().any(|&b| b != block[0])
        })
        .map(|(i, _)| i as u64)
        .collect()
}

pub fn detect(
    data: &[u8],
    geometry: Geometry,
    patterns: &[DetectedPattern],
    context: &AnalysisContext<'_>,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    anomalies.extend(bad_blocks(data, geometry));
    anomalies.extend(bit_rot(data, geometry));
    anomalies.extend(truncation(data, geometry, patterns));
    anomalies.extend(header_corruption(data, patterns));
    anomalies.extend(pattern_transitions(patterns));
    anomalies.extend(entropy_discontinuities(data, geometry));
    anomalies.extend(ecc_failures(context, geometry));
    anomalies.extend(protection_state(context));

    anomalies.sort_by_key(|a| std::cmp::Reverse(a.severity));
    anomalies
}

fn bad_blocks(data: &[u8], geometry: Geometry) -> Option<Anomaly> {
    let blocks = bad_block_candidates(data, geometry);
    if blocks.is_empty() {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::BadBlocks,
        severity: if blocks.len() > 10 {
            Severity::Warning
        } else {
            Severity::Info
        },
        location: blocks.first().map(|&b| b as usize * geometry.block_bytes()),
        description: format!("Found {} potential bad blocks", blocks.len()),
        recommendation: "Bad blocks are normal for NAND flash. Use ECC and bad block management.".into(),
    })
}

fn bit_rot(data: &[u8], geometry: Geometry) -> Option<Anomaly> {
    let pages = data.chunks(geometry.page_size);
    let total = pages.len();
    let mut first = None;
    let mut suspicious = 0usize;

    for (i, page) in data.chunks(geometry.page_size).enumerate() {
        let near_ff = page.iter().filter(|&&b| is_near_erased(b)).count();
        let near_zero = page.iter().filter(|&&b| is_near_zero(b)).count();
        if near_ff > BIT_ROT_BYTES_PER_PAGE || near_zero > BIT_ROT_BYTES_PER_PAGE {
            suspicious += 1;
            first.get_or_insert(i * geometry.page_size);
        }
    }
    if suspicious == 0 {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::BitRot,
        severity: if suspicious > total / 10 {
            Severity::Warning
        } else {
            Severity::Info
        },
        location: first,
        description: format!("{} pages show signs of bit rot", suspicious),
        recommendation: "Apply ECC correction. Consider re-reading with slower timing.".into(),
    })
}

fn truncation(data: &[u8], geometry: Geometry, patterns: &[DetectedPattern]) -> Option<Anomaly> {
    if data.len() < geometry.page_size {
        return Some(Anomaly {
            kind: AnomalyKind::Truncation,
            severity: Severity::Critical,
            location: Some(data.len()),
            description: "Dump is shorter than one page".into(),
            recommendation: "Re-dump the chip and make sure the read completes.".into(),
        });
    }
    let last = patterns.last()?;
    let ends_mid_block = data.len() % geometry.block_bytes() != 0;
    if last.pattern_type != PatternType::Empty && last.end_offset == data.len() && ends_mid_block {
        return Some(Anomaly {
            kind: AnomalyKind::Truncation,
            severity: Severity::Warning,
            location: Some(data.len()),
            description: "Dump does not end on a block boundary".into(),
            recommendation: "Check that the dump size matches the chip capacity.".into(),
        });
    }
    None
}

fn header_corruption(data: &[u8], patterns: &[DetectedPattern]) -> Vec<Anomaly> {
    patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::Compressed)
        .filter_map(|p| {
            let header = data.get(p.start_offset..p.start_offset + 10)?;
            (shannon_entropy(header) < 2.0).then(|| Anomaly {
                kind: AnomalyKind::HeaderCorruption,
                severity: Severity::Warning,
                location: Some(p.start_offset),
                description: format!("Compressed header at 0x{:X} may be corrupted", p.start_offset),
                recommendation: "Try alternative decompressors or repair the header by hand.".into(),
            })
        })
        .collect()
}

fn pattern_transitions(patterns: &[DetectedPattern]) -> Vec<Anomaly> {
    let mut anomalies: Vec<Anomaly> = patterns
        .windows(2)
        .filter(|w| {
            w[0].pattern_type == PatternType::Encrypted
                && w[1].pattern_type == PatternType::Text
                && w[1].start_offset - w[0].end_offset < 16
        })
        .map(|w| Anomaly {
            kind: AnomalyKind::PatternTransition,
            severity: Severity::Info,
            location: Some(w[0].end_offset),
            description: format!("Encrypted data followed directly by text at 0x{:X}", w[0].end_offset),
            recommendation: "May be an encryption boundary or a misclassified region.".into(),
        })
        .collect();

    let empty_regions = patterns
        .iter()
        .filter(|p| p.pattern_type == PatternType::Empty)
        .count();
    if empty_regions > 10 && patterns.len() > 20 {
        anomalies.push(Anomaly {
            kind: AnomalyKind::Fragmentation,
            severity: Severity::Info,
            location: None,
            description: format!("Highly fragmented empty space ({} regions)", empty_regions),
            recommendation: "May indicate heavy wear or deleted data.".into(),
        });
    }
    anomalies
}

/// Entropy jumps between neighbouring blocks that both hold data.
fn entropy_discontinuities(data: &[u8], geometry: Geometry) -> Option<Anomaly> {
    let entropies = block_entropies(data, geometry.block_bytes());
    let jumps: Vec<usize> = entropies
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] > 1.0 && w[1] > 1.0 && (w[0] - w[1]).abs() > ENTROPY_STEP)
        .map(|(i, _)| (i + 1) * geometry.block_bytes())
        .collect();
    let first = *jumps.first()?;
    Some(Anomaly {
        kind: AnomalyKind::EntropyDiscontinuity,
        severity: Severity::Info,
        location: Some(first),
        description: format!(
            "{} entropy discontinuities between blocks, first at 0x{:X}",
            jumps.len(),
            first
        ),
        recommendation: "Check for partition boundaries or blocks read with the wrong geometry.".into(),
    })
}

/// Uncorrectable pages from the dump, grouped into runs of consecutive pages.
fn ecc_failures(context: &AnalysisContext<'_>, geometry: Geometry) -> Vec<Anomaly> {
    let bad: Vec<u64> = context
        .page_ecc
        .iter()
        .filter(|p| p.status.is_uncorrectable())
        .filter_map(|p| p.page.checked_sub(context.first_page))
        .collect();

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for page in bad {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == page => *end = page,
            _ => runs.push((page, page)),
        }
    }

    let mut anomalies = Vec::new();
    let mut isolated = Vec::new();
    for (start, end) in runs {
        if end > start {
            anomalies.push(Anomaly {
                kind: AnomalyKind::EccFailure,
                severity: Severity::Critical,
                location: Some(start as usize * geometry.page_size),
                description: format!(
                    "Uncorrectable ECC cluster on pages {}..={}",
                    start + context.first_page,
                    end + context.first_page
                ),
                recommendation: "Re-read these pages; mark the block bad if the failure persists.".into(),
            });
        } else {
            isolated.push(start);
        }
    }
    if let Some(&first) = isolated.first() {
        anomalies.push(Anomaly {
            kind: AnomalyKind::EccFailure,
            severity: Severity::Warning,
            location: Some(first as usize * geometry.page_size),
            description: format!("{} isolated pages failed ECC", isolated.len()),
            recommendation: "Re-read the pages or try a stronger ECC scheme.".into(),
        });
    }
    anomalies
}

fn protection_state(context: &AnalysisContext<'_>) -> Option<Anomaly> {
    let chip = context.chip?;
    let bits = chip.protection?;
    if !bits.has_orphan_modifiers() {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::ProtectionInconsistency,
        severity: Severity::Warning,
        location: None,
        description: format!("Protection modifiers set without block-protect bits ({})", bits),
        recommendation: "Status registers may be corrupted. Rewrite them with unlock.".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::EccStatus;
    use crate::session::PageEcc;

    const GEO: Geometry = Geometry {
        page_size: 2048,
        pages_per_block: 64,
    };

    #[test]
    fn test_bad_block_marker() {
        let mut data = vec![0xFF; GEO.block_bytes() * 3];
        let block = GEO.block_bytes();
        data[block] = 0x00;
        data[block + 2048] = 0x00;
        assert_eq!(bad_block_candidates(&data, GEO), BTreeSet::from([1]));
        assert!(bad_block_candidates(&vec![0u8; block * 2], GEO).is_empty());

        let anomaly = bad_blocks(&data, GEO).unwrap();
        assert_eq!(anomaly.severity, Severity::Info);
        assert_eq!(anomaly.location, Some(block));
    }

    #[test]
    fn test_bit_rot_detection() {
        let mut data = vec![0xFF; 2048 * 4];
        for i in 0..20 {
            data[i * 50] = 0xEF;
        }
        let anomaly = bit_rot(&data, GEO).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::BitRot);
        assert_eq!(anomaly.severity, Severity::Warning);
        assert_eq!(anomaly.location, Some(0));
    }

    #[test]
    fn test_short_dump_is_critical() {
        let anomaly = truncation(&[0u8; 100], GEO, &[]).unwrap();
        assert_eq!(anomaly.severity, Severity::Critical);
    }

    #[test]
    fn test_ecc_clusters() {
        let page_ecc: Vec<PageEcc> = [
            (3, EccStatus::Uncorrectable),
            (4, EccStatus::Uncorrectable),
            (5, EccStatus::Corrected(1)),
            (9, EccStatus::Uncorrectable),
        ]
        .into_iter()
        .map(|(page, status)| PageEcc { page, status })
        .collect();
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            ..Default::default()
        };
        let anomalies = ecc_failures(&context, GEO);
        assert_eq!(anomalies.len(), 2);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert_eq!(anomalies[0].location, Some(3 * 2048));
        assert_eq!(anomalies[1].severity, Severity::Warning);
    }

    #[test]
    fn test_ecc_locations_relative_to_dump_start() {
        let page_ecc = vec![
            PageEcc {
                page: 130,
                status: EccStatus::Uncorrectable,
            },
            PageEcc {
                page: 131,
                status: EccStatus::Uncorrectable,
            },
            PageEcc {
                page: 140,
                status: EccStatus::Uncorrectable,
            },
        ];
        let context = AnalysisContext {
            page_ecc: &page_ecc,
            first_page: 128,
            chip: None,
        };
        let anomalies = ecc_failures(&context, GEO);
        assert_eq!(anomalies[0].location, Some(2 * 2048));
        assert!(anomalies[0].description.contains("130..=131"));
        assert_eq!(anomalies[1].location, Some(12 * 2048));
    }

    #[test]
    fn test_sorted_most_severe_first() {
        let mut data = vec![0xFF; 2048 * 4];
        for i in 0..20 {
            data[i * 50] = 0xEF;
        }
        data.truncate(1000);
        let anomalies = detect(&data, GEO, &[], &AnalysisContext::default());
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert!(anomalies.windows(2).all(|w| w[0].severity >= w[1].severity));
    }
}
