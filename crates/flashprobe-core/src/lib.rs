//! flashprobe-core: flash memory acquisition and analysis.
//!
//! Talks to a flash programmer over a fixed 64-byte frame protocol,
//! identifies the attached chip, reads, erases and writes it, and analyses
//! the resulting dumps.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command IDs, frame codec, typed operations
//! - **Transport**: USB (nusb), TCP/Unix socket, emulated programmer, mock
//! - **Chip**: Chip database, ID resolution, ONFI/eMMC/UFS descriptors
//! - **ECC**: Hamming and BCH page codecs
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Orchestrator for dump, erase, write, unlock, LUN select
//! - **Analysis**: Pure dump analysis pipeline
//!
//! # Example
//!
//! ```no_run
//! use flashprobe_core::session::{CancelToken, FlashSession, SessionConfig};
//! use flashprobe_core::transport::Endpoint;
//!
//! let endpoint: Endpoint = "tcp:192.168.1.50:5555".parse().expect("bad endpoint");
//! let mut session = FlashSession::new(SessionConfig::default());
//! session.connect(&endpoint).expect("connect failed");
//! let outcome = session.dump(0, 64, 2048, &CancelToken::new()).expect("dump failed");
//! ```

pub mod analysis;
pub mod chip;
pub mod ecc;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use analysis::{AiAnalysisResponse, AnalysisContext, AnalysisResult, ai_analyze, ai_analyze_with, analyze};
pub use chip::{ChipDatabase, ChipInfo, DeviceCapabilities, FlashInterface, ProtectionBits, UfsLunType};
pub use ecc::{EccEngine, EccScheme, EccStatus};
pub use error::{Error, OperationError, ValidationError};
pub use events::{FlashEvent, FlashObserver, LogLevel, NullObserver, OperationKind, TracingObserver};
pub use protocol::{Command, Operation, ProtocolError, Status};
pub use session::{CancelToken, DeviceState, DumpOutcome, DumpReport, FlashSession, PartialDump, SessionConfig};
pub use transport::{EmulatedDevice, Endpoint, MockTransport, NusbTransport, Transport, TransportError};
