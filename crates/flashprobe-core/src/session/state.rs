//! Session state machine and resumable operation state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::chip::{ChipError, FlashInterface, UfsLunType};
use crate::ecc::{EccScheme, EccStatus};

/// Lifecycle of one programmer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Disconnected,
    Identifying,
    Ready,
    Dumping,
    Erasing,
    Writing,
    SelectingLun,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Disconnected => write!(f, "DISCONNECTED"),
            DeviceState::Identifying => write!(f, "IDENTIFYING"),
            DeviceState::Ready => write!(f, "READY"),
            DeviceState::Dumping => write!(f, "DUMPING"),
            DeviceState::Erasing => write!(f, "ERASING"),
            DeviceState::Writing => write!(f, "WRITING"),
            DeviceState::SelectingLun => write!(f, "SELECTING_LUN"),
        }
    }
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a dump reads from. A resume is only valid against the same target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpTarget {
    pub interface: FlashInterface,
    pub lun: Option<UfsLunType>,
    pub chip_id: Vec<u8>,
    pub page_size: u32,
    /// Spare bytes read per page (non-zero only with ECC).
    pub spare_size: u32,
    pub ecc: EccScheme,
}

impl fmt::Display for DumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interface)?;
        if let Some(lun) = self.lun {
            write!(f, " LUN {}", lun)?;
        }
        write!(f, ", {}+{} byte pages", self.page_size, self.spare_size)
    }
}

/// Chunk-level progress of a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpState {
    pub target: DumpTarget,
    pub start_page: u64,
    pub num_pages: u64,
    pub chunk_pages: u32,
    /// First chunk not yet read.
    pub next_chunk: u64,
    /// Failed attempts on `next_chunk`.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl DumpState {
    pub fn new(target: DumpTarget, start_page: u64, num_pages: u64, chunk_pages: u32) -> Self {
        Self {
            target,
            start_page,
            num_pages,
            chunk_pages: chunk_pages.max(1),
            next_chunk: 0,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.num_pages.div_ceil(self.chunk_pages as u64)
    }

    pub fn completed_pages(&self) -> u64 {
        (self.next_chunk * self.chunk_pages as u64).min(self.num_pages)
    }

    pub fn is_complete(&self) -> bool {
        self.next_chunk >= self.total_chunks()
    }

    /// First page and page count of the next chunk.
    pub fn next_span(&self) -> Option<(u64, u64)> {
        if self.is_complete() {
            return None;
        }
        let done = self.completed_pages();
        let count = (self.chunk_pages as u64).min(self.num_pages - done);
        Some((self.start_page + done, count))
    }

    /// Byte offset into the dump of the first page not yet read.
    pub fn next_offset(&self) -> u64 {
        self.completed_pages() * self.target.page_size as u64
    }

    pub fn percent(&self) -> u8 {
        if self.num_pages == 0 {
            return 100;
        }
        (self.completed_pages() * 100 / self.num_pages) as u8
    }

    pub fn advance(&mut self) {
        self.next_chunk += 1;
        self.attempts = 0;
        self.last_error = None;
    }
}

/// Per-page ECC outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEcc {
    pub page: u64,
    pub status: EccStatus,
}

/// Everything a stopped dump had gathered, enough to resume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDump {
    pub state: DumpState,
    /// Data of every completed page, in page order.
    pub data: Vec<u8>,
    pub page_ecc: Vec<PageEcc>,
    pub bad_block_candidates: BTreeSet<u64>,
}

impl PartialDump {
    pub fn new(state: DumpState) -> Self {
        Self {
            state,
            data: Vec::new(),
            page_ecc: Vec::new(),
            bad_block_candidates: BTreeSet::new(),
        }
    }
}

/// Result of a finished dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    /// Exactly `num_pages * page_size` bytes.
    pub data: Vec<u8>,
    /// One entry per page when ECC is enabled, otherwise empty.
    pub page_ecc: Vec<PageEcc>,
    pub bad_block_candidates: Vec<u64>,
}

impl DumpReport {
    pub fn corrected_bits(&self) -> u64 {
        self.page_ecc.iter().map(|p| p.status.corrected_bits() as u64).sum()
    }

    pub fn uncorrectable_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.page_ecc
            .iter()
            .filter(|p| p.status.is_uncorrectable())
            .map(|p| p.page)
    }

    /// Fails on the first page ECC could not correct.
    pub fn ensure_correctable(&self) -> Result<(), ChipError> {
        match self.uncorrectable_pages().next() {
            Some(page) => Err(ChipError::UncorrectableEcc { page }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    Complete(DumpReport),
    Cancelled(PartialDump),
}

impl DumpOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, DumpOutcome::Complete(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome {
    Complete { blocks: u64 },
    Cancelled { erased_blocks: u64 },
}
