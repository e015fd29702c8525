//! Magic-byte signature scan at page-aligned offsets.

use super::Signature;

/// Known on-flash magics: name, bytes, base confidence, filesystem it implies.
const SIGNATURES: &[(&str, &[u8], f32, Option<&str>)] = &[
    ("SquashFS", b"hsqs", 0.95, Some("SquashFS")),
    ("UBIFS", b"UBI#", 0.9, Some("UBIFS")),
    ("UBI volume", b"UBI!", 0.85, Some("UBIFS")),
    ("YAFFS2", b"YFIL", 0.85, Some("YAFFS2")),
    ("CramFS", &[0x45, 0x3D, 0xCD, 0x28], 0.9, Some("CramFS")),
    ("JFFS2", &[0x85, 0x19], 0.5, Some("JFFS2")),
    ("Sigma Designs", b"SIGMA", 0.8, None),
    ("U-Boot image", &[0x27, 0x05, 0x19, 0x56], 0.9, None),
    ("Device tree", &[0xD0, 0x0D, 0xFE, 0xED], 0.85, None),
    ("Android boot", b"ANDROID!", 0.95, None),
    ("ELF", b"\x7FELF", 0.9, None),
    ("gzip", &[0x1F, 0x8B, 0x08], 0.7, None),
];

/// Filesystems in the order they win when several are present.
const FILESYSTEM_PRIORITY: &[&str] = &["SquashFS", "UBIFS", "YAFFS2", "CramFS", "JFFS2"];

/// Longer magics are less likely to match by chance.
fn length_factor(len: usize) -> f32 {
    (0.7 + 0.075 * len as f32).min(1.0)
}

/// Block-aligned hits are more plausible than mid-block ones.
fn alignment_factor(offset: usize, block_bytes: usize) -> f32 {
    if offset % block_bytes == 0 { 1.0 } else { 0.9 }
}

/// All signature hits at page-aligned offsets, ordered by offset.
pub fn scan(data: &[u8], page_size: usize, block_bytes: usize) -> Vec<Signature> {
    let page_size = page_size.max(1);
    let block_bytes = block_bytes.max(page_size);
    let mut found = Vec::new();

    for offset in (0..data.len()).step_by(page_size) {
        let window = &data[offset..];
        for (name, magic, base, _) in SIGNATURES {
            if window.starts_with(magic) {
                let confidence = base * length_factor(magic.len()) * alignment_factor(offset, block_bytes);
                found.push(Signature {
                    name: name.to_string(),
                    offset,
                    confidence: confidence.clamp(0.0, 1.0),
                });
            }
        }
    }
    found
}

/// Most likely filesystem among the hits.
pub fn filesystem_type(signatures: &[Signature]) -> Option<String> {
    FILESYSTEM_PRIORITY
        .iter()
        .find(|fs| {
            signatures.iter().any(|s| {
                SIGNATURES
                    .iter()
                    .any(|(name, _, _, implied)| *name == s.name && implied == &Some(**fs))
            })
        })
        .map(|fs| fs.to_string())
}
