//! Flash session - orchestrates identification, dumps, erases and writes.

pub mod config;
pub mod link;
pub mod state;

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument, warn};

pub use config::{EccConfig, SessionConfig};
pub use link::{Link, Response};
pub use state::{
    CancelToken, DeviceState, DumpOutcome, DumpReport, DumpState, DumpTarget, EraseOutcome, PageEcc,
    PartialDump,
};

use crate::chip::ufs::parse_unit_descriptor;
use crate::chip::{
    self, ChipDatabase, ChipError, ChipInfo, DeviceCapabilities, FlashInterface, OnfiParams, ProtectionBits,
    Resolution, UfsLunType,
};
use crate::ecc::{EccEngine, EccScheme};
use crate::error::{Error, OperationError, ValidationError};
use crate::events::{FlashEvent, FlashObserver, LogLevel, OperationKind, TracingObserver};
use crate::protocol::constants::{SECTOR_BYTES, SPI_NAND_FEATURE_BLOCK_LOCK, UFS_DESC_DEVICE, UFS_DESC_UNIT};
use crate::protocol::{Operation, PageSpan, ProtocolError};
use crate::transport::{self, Endpoint, Transport};

/// SPI NOR page program never crosses this boundary.
const NOR_PROGRAM_PAGE: usize = 256;
const NOR_SECTOR: u64 = 4096;
const NOR_BLOCK: u64 = 64 * 1024;
/// BP2..BP0, INV and CMP in the SPI NAND lock register.
const SPI_NAND_LOCK_BITS: u8 = 0x3E;
/// LUNs probed during UFS identification, in preference order.
const UFS_LUNS: [UfsLunType; 4] = [
    UfsLunType::UserData,
    UfsLunType::BootA,
    UfsLunType::BootB,
    UfsLunType::Rpmb,
];

/// Flash session - one programmer connection and the chip behind it.
pub struct FlashSession<O: FlashObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    db: Arc<ChipDatabase>,
    link: Option<Link>,
    state: DeviceState,
    firmware: Option<String>,
    capabilities: Option<DeviceCapabilities>,
    chip: Option<ChipInfo>,
    ecc: Option<EccEngine>,
    selected_lun: Option<UfsLunType>,
}

impl FlashSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver + 'static> FlashSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            db: ChipDatabase::builtin_shared(),
            link: None,
            state: DeviceState::Disconnected,
            firmware: None,
            capabilities: None,
            chip: None,
            ecc: None,
            selected_lun: None,
        }
    }

    /// Use a different chip database, e.g. one extended from a TOML file.
    pub fn with_database(mut self, db: Arc<ChipDatabase>) -> Self {
        self.db = db;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn chip_info(&self) -> Option<&ChipInfo> {
        self.chip.as_ref()
    }

    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.capabilities
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn selected_lun(&self) -> Option<UfsLunType> {
        self.selected_lun
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.link.as_ref().and_then(Link::endpoint)
    }

    /// USB programmers plus the configured network endpoints.
    pub fn scan_devices(&self) -> Vec<Endpoint> {
        let mut found = match transport::scan_devices() {
            Ok(devices) => devices.iter().map(|d| d.endpoint()).collect(),
            Err(e) => {
                warn!(error = %e, "USB enumeration failed");
                Vec::new()
            }
        };
        found.extend(self.config.endpoints.iter().cloned());
        found
    }

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<(), Error> {
        let transport = endpoint.connect()?;
        self.attach(transport)
    }

    /// Take over an already open transport, then identify the chip.
    #[instrument(skip_all)]
    pub fn attach(&mut self, transport: Box<dyn Transport>) -> Result<(), Error> {
        if self.link.is_some() {
            self.disconnect();
        }
        let observer: Arc<dyn FlashObserver> = self.observer.clone();
        self.link = Some(Link::new(transport, observer));
        self.goto(DeviceState::Identifying);

        match self.handshake() {
            Ok(()) => {
                self.goto(DeviceState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connection setup failed");
                self.disconnect();
                Err(e)
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
            info!("Disconnected");
            self.emit(FlashEvent::DeviceDisconnected);
        }
        self.clear_device();
        self.goto(DeviceState::Disconnected);
    }

    /// Switch the programmer to another bus and identify what is on it.
    #[instrument(skip(self))]
    pub fn set_interface(&mut self, interface: FlashInterface) -> Result<(), Error> {
        self.require_ready("set interface")?;
        self.goto(DeviceState::Identifying);
        let result = self.select_interface(interface);
        self.settle(result)
    }

    /// Read `num_pages` pages of `page_size` bytes starting at `start_page`.
    #[instrument(skip(self, cancel))]
    pub fn dump(
        &mut self,
        start_page: u64,
        num_pages: u64,
        page_size: u32,
        cancel: &CancelToken,
    ) -> Result<DumpOutcome, Error> {
        self.require_ready("dump")?;
        let target = self.transfer_target(page_size)?;
        let len = num_pages.checked_mul(page_size as u64).unwrap_or(u64::MAX);
        self.check_range(start_page.saturating_mul(page_size as u64), len)?;
        info!(
            target = %target,
            start_page = start_page,
            num_pages = num_pages,
            "Starting dump"
        );
        let state = DumpState::new(target, start_page, num_pages, self.config.chunk_pages());
        self.run_dump(PartialDump::new(state), cancel)
    }

    /// Continue a cancelled or aborted dump from its first unread chunk.
    #[instrument(skip(self, partial, cancel), fields(next_chunk = partial.state.next_chunk))]
    pub fn resume_dump(&mut self, partial: PartialDump, cancel: &CancelToken) -> Result<DumpOutcome, Error> {
        self.require_ready("resume dump")?;
        let target = self.transfer_target(partial.state.target.page_size)?;
        if target != partial.state.target {
            return Err(OperationError::ResumeTargetMismatch(format!(
                "dump was taken from {}, session now targets {}",
                partial.state.target, target
            ))
            .into());
        }
        info!(offset = %format!("0x{:X}", partial.state.next_offset()), "Resuming dump");
        self.run_dump(partial, cancel)
    }

    /// Erase the smallest erase unit: a 4 KiB NOR sector or one eMMC sector.
    #[instrument(skip(self), fields(address = %format!("0x{:X}", address)))]
    pub fn erase_sector(&mut self, address: u64) -> Result<(), Error> {
        self.require_ready("erase sector")?;
        let chip = self.chip()?.clone();
        let unit = match chip.interface {
            FlashInterface::SpiNor => chip.sector_size.map(u64::from).unwrap_or(NOR_SECTOR),
            FlashInterface::Emmc => SECTOR_BYTES as u64,
            other => {
                return Err(ChipError::CapabilityMismatch {
                    interface: other,
                    operation: "sector erase",
                }
                .into());
            }
        };
        check_alignment(address, unit)?;
        self.check_range(address, unit)?;
        let op = match chip.interface {
            FlashInterface::SpiNor => Operation::NorSectorErase {
                address: to_wire(address)?,
            },
            _ => {
                let lba = to_wire(address / SECTOR_BYTES as u64)?;
                Operation::EmmcErase {
                    start_lba: lba,
                    end_lba: lba,
                }
            }
        };
        self.run_erase(address, op)
    }

    /// Erase one erase block: 64 KiB on NOR, one NAND block, one eMMC erase unit.
    #[instrument(skip(self), fields(address = %format!("0x{:X}", address)))]
    pub fn erase_block(&mut self, address: u64) -> Result<(), Error> {
        self.require_ready("erase block")?;
        let chip = self.chip()?.clone();
        let unit = match chip.interface {
            FlashInterface::SpiNor => NOR_BLOCK,
            FlashInterface::ParallelNand | FlashInterface::SpiNand | FlashInterface::Emmc => chip.block_bytes(),
            FlashInterface::Ufs => {
                return Err(ChipError::CapabilityMismatch {
                    interface: FlashInterface::Ufs,
                    operation: "block erase",
                }
                .into());
            }
        };
        check_alignment(address, unit)?;
        self.check_range(address, unit)?;
        let op = match chip.interface {
            FlashInterface::SpiNor => Operation::NorBlockErase {
                address: to_wire(address)?,
            },
            FlashInterface::ParallelNand => Operation::NandEraseBlock {
                page: to_wire(address / chip.page_size as u64)?,
            },
            FlashInterface::SpiNand => Operation::SpiNandEraseBlock {
                page: to_wire(address / chip.page_size as u64)?,
            },
            _ => Operation::EmmcErase {
                start_lba: to_wire(address / SECTOR_BYTES as u64)?,
                end_lba: to_wire((address + unit) / SECTOR_BYTES as u64 - 1)?,
            },
        };
        self.run_erase(address, op)
    }

    /// Erase the whole chip. Nothing is sent unless `confirmed` is set.
    #[instrument(skip(self, cancel))]
    pub fn erase_chip(&mut self, confirmed: bool, cancel: &CancelToken) -> Result<EraseOutcome, Error> {
        if !confirmed {
            warn!("Chip erase requested without confirmation");
            return Err(OperationError::NotConfirmed.into());
        }
        self.require_ready("erase chip")?;
        let chip = self.chip()?.clone();
        if chip.interface == FlashInterface::Ufs {
            return Err(ChipError::CapabilityMismatch {
                interface: FlashInterface::Ufs,
                operation: "chip erase",
            }
            .into());
        }
        let blocks = chip.total_blocks().ok_or_else(|| ChipError::Unresolved { raw_id: chip.id_hex() })?;

        info!(interface = %chip.interface, blocks = blocks, "Erasing chip");
        self.goto(DeviceState::Erasing);
        self.progress(OperationKind::Erase, 0, blocks);
        let result = match chip.interface {
            FlashInterface::ParallelNand | FlashInterface::SpiNand => self.erase_nand_blocks(&chip, blocks, cancel),
            FlashInterface::SpiNor => self
                .erase_step(0, &Operation::NorChipErase)
                .map(|_| EraseOutcome::Complete { blocks }),
            _ => to_wire(chip.capacity_bytes() / SECTOR_BYTES as u64 - 1).and_then(|end_lba| {
                self.erase_step(0, &Operation::EmmcErase { start_lba: 0, end_lba })
                    .map(|_| EraseOutcome::Complete { blocks })
            }),
        };
        let outcome = self.settle(result)?;
        if let EraseOutcome::Complete { .. } = outcome {
            self.progress(OperationKind::Erase, blocks, blocks);
            self.emit(FlashEvent::Complete {
                operation: OperationKind::Erase,
            });
        }
        Ok(outcome)
    }

    /// Program whole pages starting at `start_page`, optionally reading them back.
    ///
    /// Returns the number of pages written. Failures are never retried.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn write(&mut self, start_page: u64, data: &[u8], verify: bool) -> Result<u64, Error> {
        self.require_ready("write")?;
        let page_size = self.program_unit()?;
        if data.len() as u64 % page_size as u64 != 0 {
            return Err(ValidationError::UnalignedLength {
                len: data.len() as u64,
                unit: page_size as u64,
            }
            .into());
        }
        let target = self.transfer_target(page_size)?;
        self.check_range(start_page.saturating_mul(page_size as u64), data.len() as u64)?;

        info!(target = %target, start_page = start_page, verify = verify, "Starting write");
        self.goto(DeviceState::Writing);
        let result = self.write_pages(&target, start_page, data, verify);
        let pages = self.settle(result)?;
        self.emit(FlashEvent::Complete {
            operation: OperationKind::Write,
        });
        Ok(pages)
    }

    /// Clear every block-protect bit, then report what the chip now says.
    #[instrument(skip(self))]
    pub fn unlock_all(&mut self) -> Result<ProtectionBits, Error> {
        self.require_ready("unlock")?;
        let interface = self.chip()?.interface;
        let result = match interface {
            FlashInterface::SpiNor => self.unlock_nor(),
            FlashInterface::SpiNand => self.unlock_spi_nand(),
            other => Err(ChipError::CapabilityMismatch {
                interface: other,
                operation: "unlock",
            }
            .into()),
        };
        let remaining = self.settle(result)?;
        if let Some(chip) = self.chip.as_mut() {
            chip.protection = Some(remaining);
        }
        if !remaining.is_clear() {
            warn!(remaining = %remaining, "Protection bits survived unlock");
            return Err(OperationError::UnlockIncomplete { remaining }.into());
        }
        info!("Block protection cleared");
        self.emit(FlashEvent::Complete {
            operation: OperationKind::Unlock,
        });
        Ok(remaining)
    }

    /// Make `lun_type` the target of subsequent UFS transfers.
    #[instrument(skip(self))]
    pub fn select_ufs_lun(&mut self, lun_type: UfsLunType) -> Result<(), Error> {
        self.require_ready("select LUN")?;
        let chip = self.chip()?;
        if chip.interface != FlashInterface::Ufs {
            return Err(ChipError::CapabilityMismatch {
                interface: chip.interface,
                operation: "LUN selection",
            }
            .into());
        }
        let lun = chip.lun(lun_type).ok_or(ValidationError::InvalidLun {
            lun: lun_type,
            reason: "not present",
        })?;
        if !lun.enabled {
            return Err(ValidationError::InvalidLun {
                lun: lun_type,
                reason: "not enabled",
            }
            .into());
        }

        self.goto(DeviceState::SelectingLun);
        let result = self.request(&Operation::UfsSelectLun {
            lun: lun_type.lun_id(),
        });
        self.settle(result)?;
        if self.selected_lun != Some(lun_type) {
            info!(lun = %lun_type, "LUN selected");
        }
        self.selected_lun = Some(lun_type);
        self.emit(FlashEvent::Complete {
            operation: OperationKind::SelectLun,
        });
        Ok(())
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn progress(&self, operation: OperationKind, current: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (current.min(total) * 100 / total) as u8
        };
        self.emit(FlashEvent::Progress {
            operation,
            percent,
            current,
            total,
        });
    }

    fn goto(&mut self, to: DeviceState) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, "State transition");
        self.emit(FlashEvent::StateChanged { from: self.state, to });
        self.state = to;
    }

    fn require_ready(&self, operation: &'static str) -> Result<(), Error> {
        match self.state {
            DeviceState::Ready => Ok(()),
            DeviceState::Disconnected => Err(Error::NotConnected),
            state => Err(OperationError::InvalidState { operation, state }.into()),
        }
    }

    /// Return to `Ready`, or to `Disconnected` when the transport is gone.
    fn settle<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Err(e) if e.is_disconnect() => {
                warn!(error = %e, "Device lost");
                self.disconnect();
            }
            _ => self.goto(DeviceState::Ready),
        }
        result
    }

    fn clear_device(&mut self) {
        self.firmware = None;
        self.capabilities = None;
        self.chip = None;
        self.ecc = None;
        self.selected_lun = None;
    }

    fn chip(&self) -> Result<&ChipInfo, Error> {
        self.chip.as_ref().ok_or_else(|| {
            ChipError::Unresolved {
                raw_id: String::new(),
            }
            .into()
        })
    }

    fn link(&self) -> Result<&Link, Error> {
        self.link.as_ref().ok_or(Error::NotConnected)
    }

    fn request(&self, op: &Operation) -> Result<Response, Error> {
        self.link()?.request(op, self.config.timeout())
    }

    fn handshake(&mut self) -> Result<(), Error> {
        self.request(&Operation::Ping)?;
        let version = self.request(&Operation::GetVersion)?.reply.payload;
        let firmware = format!("{}.{}.{}", version[0], version[1], version[2]);
        let caps = DeviceCapabilities::from_bitmap(self.request(&Operation::GetCapabilities)?.reply.payload_u32(0));

        let endpoint = self
            .endpoint()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "in-process".to_string());
        info!(
            endpoint = %endpoint,
            firmware = %firmware,
            capabilities = %format!("0x{:04X}", caps.to_bitmap()),
            "Programmer connected"
        );
        self.emit(FlashEvent::DeviceConnected {
            endpoint,
            firmware: firmware.clone(),
        });
        self.firmware = Some(firmware);
        self.capabilities = Some(caps);

        let interface = match self.config.interface {
            Some(interface) => interface,
            None => caps.default_interface().ok_or(ValidationError::InvalidInterface {
                interface: FlashInterface::ParallelNand,
                reason: "programmer reports no flash interface".into(),
            })?,
        };
        self.select_interface(interface)
    }

    fn select_interface(&mut self, interface: FlashInterface) -> Result<(), Error> {
        let supported = self.capabilities.is_some_and(|c| c.supports(interface));
        if !supported {
            return Err(ValidationError::InvalidInterface {
                interface,
                reason: "not supported by the programmer".into(),
            }
            .into());
        }
        self.chip = None;
        self.ecc = None;
        self.selected_lun = None;

        self.request(&Operation::SetInterface { interface })?;
        let info = self.identify(interface)?;

        if !info.resolved {
            self.log(
                LogLevel::Warn,
                format!("Unknown chip (ID {}), using conservative defaults", info.id_hex()),
            );
        }
        self.emit(FlashEvent::ChipIdentified {
            interface,
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            resolved: info.resolved,
        });

        self.ecc = match (interface.is_nand(), self.config.ecc.scheme) {
            (true, scheme) if scheme != EccScheme::None => {
                Some(EccEngine::new(scheme, self.config.ecc.layout(info.oob_size))?)
            }
            _ => None,
        };
        self.selected_lun = info
            .luns
            .iter()
            .find(|l| l.enabled && l.lun_type == UfsLunType::UserData)
            .or_else(|| info.luns.iter().find(|l| l.enabled && l.lun_type != UfsLunType::Rpmb))
            .map(|l| l.lun_type);
        self.chip = Some(info);
        self.emit(FlashEvent::Complete {
            operation: OperationKind::Identify,
        });
        Ok(())
    }

    fn identify(&self, interface: FlashInterface) -> Result<ChipInfo, Error> {
        let resolution = match interface {
            FlashInterface::ParallelNand => {
                let id = self.request(&Operation::NandReadId { address: 0x00 })?.data;
                let resolution = chip::identify(&self.db, interface, &id);
                if resolution.is_resolved() {
                    resolution
                } else {
                    match self.read_onfi(&id)? {
                        Some(info) => Resolution::Resolved(info),
                        None => resolution,
                    }
                }
            }
            FlashInterface::SpiNand => {
                let id = self.request(&Operation::SpiNandReadId)?.data;
                chip::identify(&self.db, interface, &id)
            }
            FlashInterface::SpiNor => {
                let id = self.request(&Operation::NorReadJedecId)?.data;
                chip::identify(&self.db, interface, &id)
            }
            FlashInterface::Emmc => {
                self.request(&Operation::EmmcInit)?;
                let cid = self.request(&Operation::EmmcReadCid)?.data;
                let ext_csd = self.request(&Operation::EmmcReadExtCsd)?.data;
                chip::resolve_emmc(&self.db, &cid, &ext_csd)?
            }
            FlashInterface::Ufs => {
                self.request(&Operation::UfsInit)?;
                let device = self
                    .request(&Operation::UfsReadDescriptor {
                        idn: UFS_DESC_DEVICE,
                        index: 0,
                    })?
                    .data;
                let mut luns = Vec::new();
                for lun_type in UFS_LUNS {
                    let op = Operation::UfsReadDescriptor {
                        idn: UFS_DESC_UNIT,
                        index: lun_type.lun_id(),
                    };
                    match self.request(&op) {
                        Ok(r) => luns.push(parse_unit_descriptor(lun_type, &r.data)?),
                        Err(Error::Protocol(ProtocolError::DeviceStatus { .. })) => {
                            debug!(lun = %lun_type, "LUN not present");
                        }
                        Err(e) => return Err(e),
                    }
                }
                chip::resolve_ufs(&self.db, &device, luns)?
            }
        };

        let mut info = resolution.into_info();
        match interface {
            FlashInterface::SpiNor => {
                let (sr1, sr2) = self.read_nor_status()?;
                info.protection = Some(ProtectionBits::from_status(sr1, sr2));
            }
            FlashInterface::SpiNand => {
                info.protection = Some(ProtectionBits::from_spi_nand_lock(self.read_spi_nand_lock()?));
            }
            _ => {}
        }
        info!(
            manufacturer = %info.manufacturer,
            model = %info.model,
            id = %info.id_hex(),
            size_mb = info.size_mb,
            resolved = info.resolved,
            "Chip identified"
        );
        Ok(info)
    }

    /// ONFI parameter page, if the chip answers the ONFI signature read.
    fn read_onfi(&self, raw_id: &[u8]) -> Result<Option<ChipInfo>, Error> {
        let signature = match self.request(&Operation::NandReadId { address: 0x20 }) {
            Ok(r) => r.data,
            Err(Error::Protocol(ProtocolError::DeviceStatus { .. })) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !signature.starts_with(chip::onfi::ONFI_SIGNATURE) {
            return Ok(None);
        }
        let page = self.request(&Operation::NandReadParamPage)?.data;
        match OnfiParams::parse(&page) {
            Ok(params) => {
                debug!(model = %params.model, "ONFI parameter page");
                Ok(Some(params.to_chip_info(raw_id)))
            }
            Err(e) => {
                warn!(error = %e, "Ignoring ONFI parameter page");
                Ok(None)
            }
        }
    }

    fn read_nor_status(&self) -> Result<(u8, u8), Error> {
        let sr1 = self.request(&Operation::NorReadStatus1)?.byte();
        let sr2 = self.request(&Operation::NorReadStatus2)?.byte();
        debug!(sr1 = %format!("0x{:02X}", sr1), sr2 = %format!("0x{:02X}", sr2), "Status registers");
        Ok((sr1, sr2))
    }

    fn read_spi_nand_lock(&self) -> Result<u8, Error> {
        let op = Operation::SpiNandGetFeature {
            register: SPI_NAND_FEATURE_BLOCK_LOCK,
        };
        Ok(self.request(&op)?.byte())
    }

    fn unlock_nor(&self) -> Result<ProtectionBits, Error> {
        let (sr1, sr2) = self.read_nor_status()?;
        let keep = !(ProtectionBits::SR1_PROTECTION_MASK | ProtectionBits::SR1_WEL | ProtectionBits::SR1_BUSY);
        self.request(&Operation::NorWriteEnable)?;
        self.request(&Operation::NorWriteStatus1 { value: sr1 & keep })?;
        if sr2 & ProtectionBits::SR2_CMP != 0 {
            self.request(&Operation::NorWriteEnable)?;
            self.request(&Operation::NorWriteStatus2 {
                value: sr2 & !ProtectionBits::SR2_CMP,
            })?;
        }
        let (sr1, sr2) = self.read_nor_status()?;
        Ok(ProtectionBits::from_status(sr1, sr2))
    }

    fn unlock_spi_nand(&self) -> Result<ProtectionBits, Error> {
        let lock = self.read_spi_nand_lock()?;
        self.request(&Operation::SpiNandSetFeature {
            register: SPI_NAND_FEATURE_BLOCK_LOCK,
            value: lock & !SPI_NAND_LOCK_BITS,
        })?;
        Ok(ProtectionBits::from_spi_nand_lock(self.read_spi_nand_lock()?))
    }

    /// Bytes addressable on the current target: the selected LUN on UFS.
    fn capacity(&self) -> Option<u64> {
        let chip = self.chip.as_ref()?;
        match chip.interface {
            FlashInterface::Ufs => self
                .selected_lun
                .and_then(|t| chip.lun(t))
                .map(|l| l.capacity_bytes),
            _ => chip.capacity_known().then(|| chip.capacity_bytes()),
        }
    }

    fn check_range(&self, start: u64, len: u64) -> Result<(), Error> {
        let end = start.saturating_add(len);
        match self.capacity() {
            Some(capacity) if end > capacity => Err(OperationError::OutOfRange { start, end, capacity }.into()),
            _ => Ok(()),
        }
    }

    fn lun_block_size(&self, lun: UfsLunType) -> Result<u32, Error> {
        self.chip()?
            .lun(lun)
            .map(|l| l.block_size.max(1))
            .ok_or_else(|| {
                ValidationError::InvalidLun {
                    lun,
                    reason: "not present",
                }
                .into()
            })
    }

    /// Page size used for writes: the chip page, or the LUN block on UFS.
    fn program_unit(&self) -> Result<u32, Error> {
        let chip = self.chip()?;
        match (chip.interface, self.selected_lun) {
            (FlashInterface::Ufs, Some(lun_type)) => {
                let lun = chip.lun(lun_type).ok_or(ValidationError::InvalidLun {
                    lun: lun_type,
                    reason: "not present",
                })?;
                if lun.write_protected {
                    return Err(ValidationError::InvalidLun {
                        lun: lun_type,
                        reason: "write protected",
                    }
                    .into());
                }
                Ok(lun.block_size)
            }
            (FlashInterface::Ufs, None) => Err(ValidationError::InvalidLun {
                lun: UfsLunType::UserData,
                reason: "no LUN selected",
            }
            .into()),
            _ => Ok(chip.page_size),
        }
    }

    /// Describe a page-granular transfer on the current chip.
    fn transfer_target(&self, page_size: u32) -> Result<DumpTarget, Error> {
        let chip = self.chip()?;
        let interface = chip.interface;
        let lun = match interface {
            FlashInterface::Ufs => Some(self.selected_lun.ok_or(ValidationError::InvalidLun {
                lun: UfsLunType::UserData,
                reason: "no LUN selected",
            })?),
            _ => None,
        };
        let unit = match lun {
            Some(lun) => self.lun_block_size(lun)?,
            None if interface == FlashInterface::Emmc => SECTOR_BYTES,
            None => 1,
        };
        if page_size == 0 || page_size % unit != 0 {
            return Err(ValidationError::InvalidPageSize { page_size, unit }.into());
        }

        let (spare_size, ecc) = match &self.ecc {
            Some(engine) => {
                engine.check_geometry(page_size as usize)?;
                (engine.layout().spare_size as u32, self.config.ecc.scheme)
            }
            None => (0, EccScheme::None),
        };
        if interface.is_nand() && (page_size > u16::MAX as u32 || spare_size > u16::MAX as u32) {
            return Err(ValidationError::InvalidPageSize {
                page_size,
                unit: u16::MAX as u32,
            }
            .into());
        }

        Ok(DumpTarget {
            interface,
            lun,
            chip_id: chip.chip_id.clone(),
            page_size,
            spare_size,
            ecc,
        })
    }

    /// Map a page range onto the interface's addressing.
    fn transfer_op(&self, target: &DumpTarget, first: u64, count: u64, write: bool) -> Result<Operation, Error> {
        let page_size = target.page_size as u64;
        let op = match target.interface {
            FlashInterface::ParallelNand | FlashInterface::SpiNand => {
                let span = PageSpan {
                    page: to_wire(first)?,
                    count: count as u16,
                    page_size: target.page_size as u16,
                    spare_size: target.spare_size as u16,
                };
                match (target.interface, write) {
                    (FlashInterface::ParallelNand, false) => Operation::NandReadPages(span),
                    (FlashInterface::ParallelNand, true) => Operation::NandProgramPages(span),
                    (_, false) => Operation::SpiNandReadPages(span),
                    (_, true) => Operation::SpiNandProgramPages(span),
                }
            }
            FlashInterface::SpiNor => {
                let address = to_wire(first * page_size)?;
                let len = to_wire(count * page_size)?;
                if write {
                    Operation::NorPageProgram { address, len }
                } else {
                    Operation::NorRead { address, len }
                }
            }
            FlashInterface::Emmc => {
                let lba = to_wire(first * page_size / SECTOR_BYTES as u64)?;
                let count = to_wire(count * page_size / SECTOR_BYTES as u64)?;
                if write {
                    Operation::EmmcWriteBlocks { lba, count }
                } else {
                    Operation::EmmcReadBlocks { lba, count }
                }
            }
            FlashInterface::Ufs => {
                let lun_type = target.lun.unwrap_or(UfsLunType::UserData);
                let block = self.lun_block_size(lun_type)? as u64;
                let lun = lun_type.lun_id();
                let lba = to_wire(first * page_size / block)?;
                let blocks = to_wire(count * page_size / block)?;
                if write {
                    Operation::UfsWrite { lun, lba, blocks }
                } else {
                    Operation::UfsRead { lun, lba, blocks }
                }
            }
        };
        Ok(op)
    }

    fn read_chunk(&self, target: &DumpTarget, first: u64, count: u64) -> Result<Vec<u8>, Error> {
        let op = self.transfer_op(target, first, count, false)?;
        let data = self.request(&op)?.data;
        let expected = count as usize * (target.page_size + target.spare_size) as usize;
        if data.len() != expected {
            return Err(ProtocolError::MalformedPayload {
                command: op.command().id(),
                reason: format!("data phase of {} bytes, expected {}", data.len(), expected),
            }
            .into());
        }
        Ok(data)
    }

    fn read_chunk_with_retry(&self, state: &mut DumpState, first: u64, count: u64) -> Result<Vec<u8>, Error> {
        loop {
            match self.read_chunk(&state.target, first, count) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && state.attempts < self.config.max_retries => {
                    state.attempts += 1;
                    state.last_error = Some(e.to_string());
                    warn!(
                        page = first,
                        attempt = state.attempts,
                        error = %e,
                        "Chunk read failed, retrying"
                    );
                    self.emit(FlashEvent::Retry {
                        operation: OperationKind::Dump,
                        offset: state.next_offset(),
                        attempt: state.attempts,
                        reason: e.to_string(),
                    });
                    thread::sleep(self.config.retry_delay());
                }
                Err(e) => {
                    state.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
    }

    fn run_dump(&mut self, mut partial: PartialDump, cancel: &CancelToken) -> Result<DumpOutcome, Error> {
        self.goto(DeviceState::Dumping);
        let total_bytes = partial.state.num_pages * partial.state.target.page_size as u64;
        self.progress(OperationKind::Dump, partial.state.next_offset(), total_bytes);

        while let Some((first, count)) = partial.state.next_span() {
            if cancel.is_cancelled() {
                let offset = partial.state.next_offset();
                warn!(offset = %format!("0x{:X}", offset), "Dump cancelled");
                self.emit(FlashEvent::Cancelled {
                    operation: OperationKind::Dump,
                    offset,
                });
                self.goto(DeviceState::Ready);
                return Ok(DumpOutcome::Cancelled(partial));
            }

            let raw = match self.read_chunk_with_retry(&mut partial.state, first, count) {
                Ok(raw) => raw,
                Err(e) => return Err(self.abort_dump(partial, e)),
            };
            if let Err(e) = self.absorb_chunk(&mut partial, first, &raw) {
                return Err(self.abort_dump(partial, e));
            }
            partial.state.advance();
            self.progress(OperationKind::Dump, partial.state.next_offset(), total_bytes);
        }

        self.goto(DeviceState::Ready);
        let report = DumpReport {
            data: partial.data,
            page_ecc: partial.page_ecc,
            bad_block_candidates: partial.bad_block_candidates.into_iter().collect(),
        };
        info!(
            bytes = report.data.len(),
            corrected_bits = report.corrected_bits(),
            bad_blocks = report.bad_block_candidates.len(),
            "Dump complete"
        );
        self.emit(FlashEvent::Complete {
            operation: OperationKind::Dump,
        });
        Ok(DumpOutcome::Complete(report))
    }

    /// Strip spare bytes, correcting each page when ECC is on.
    fn absorb_chunk(&self, partial: &mut PartialDump, first: u64, raw: &[u8]) -> Result<(), Error> {
        let page_size = partial.state.target.page_size as usize;
        let spare_size = partial.state.target.spare_size as usize;
        let engine = match &self.ecc {
            Some(engine) if spare_size > 0 => engine,
            _ => {
                partial.data.extend_from_slice(raw);
                return Ok(());
            }
        };

        let pages_per_block = self.chip()?.block_size.max(1) as u64;
        for (i, page) in raw.chunks(page_size + spare_size).enumerate() {
            let index = first + i as u64;
            let mut data = page[..page_size].to_vec();
            let status = engine.decode_page(&mut data, &page[page_size..])?;
            if status.is_uncorrectable() {
                let block = index / pages_per_block;
                warn!(page = index, block = block, "Uncorrectable page");
                partial.bad_block_candidates.insert(block);
            } else if status.corrected_bits() > 0 {
                debug!(page = index, bits = status.corrected_bits(), "Corrected page");
            }
            partial.page_ecc.push(PageEcc { page: index, status });
            partial.data.extend_from_slice(&data);
        }
        Ok(())
    }

    fn abort_dump(&mut self, partial: PartialDump, source: Error) -> Error {
        warn!(
            offset = %format!("0x{:X}", partial.state.next_offset()),
            error = %source,
            "Dump aborted"
        );
        self.log(LogLevel::Error, format!("Dump aborted: {}", source));
        if source.is_disconnect() {
            self.disconnect();
        } else {
            self.goto(DeviceState::Ready);
        }
        Error::DumpAborted {
            partial: Box::new(partial),
            source: Box::new(source),
        }
    }

    fn run_erase(&mut self, address: u64, op: Operation) -> Result<(), Error> {
        self.goto(DeviceState::Erasing);
        let result = self.erase_step(address, &op);
        self.settle(result)?;
        self.emit(FlashEvent::Complete {
            operation: OperationKind::Erase,
        });
        Ok(())
    }

    /// One erase command; NOR needs write-enable first. Never retried.
    fn erase_step(&self, address: u64, op: &Operation) -> Result<(), Error> {
        if op.command().subsystem() == crate::protocol::Subsystem::SpiNor {
            self.request(&Operation::NorWriteEnable)?;
        }
        debug!(op = ?op, "Erase");
        match self.link()?.request(op, self.config.erase_timeout()) {
            Ok(_) => Ok(()),
            Err(Error::Protocol(ProtocolError::DeviceStatus { status, .. })) => Err(OperationError::EraseFailed {
                address,
                reason: format!("device reported {}", status),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    fn erase_nand_blocks(&self, chip: &ChipInfo, blocks: u64, cancel: &CancelToken) -> Result<EraseOutcome, Error> {
        let pages_per_block = chip.block_size as u64;
        for block in 0..blocks {
            if cancel.is_cancelled() {
                let offset = block * chip.block_bytes();
                warn!(erased_blocks = block, "Chip erase cancelled");
                self.emit(FlashEvent::Cancelled {
                    operation: OperationKind::Erase,
                    offset,
                });
                return Ok(EraseOutcome::Cancelled { erased_blocks: block });
            }
            let page = to_wire(block * pages_per_block)?;
            let op = match chip.interface {
                FlashInterface::SpiNand => Operation::SpiNandEraseBlock { page },
                _ => Operation::NandEraseBlock { page },
            };
            self.erase_step(block * chip.block_bytes(), &op)?;
            self.progress(OperationKind::Erase, block + 1, blocks);
        }
        Ok(EraseOutcome::Complete { blocks })
    }

    fn write_pages(&self, target: &DumpTarget, start_page: u64, data: &[u8], verify: bool) -> Result<u64, Error> {
        let page_size = target.page_size as usize;
        let total = (data.len() / page_size) as u64;
        let chunk_pages = self.config.chunk_pages() as usize;
        let mut done = 0u64;
        self.progress(OperationKind::Write, 0, total);

        for chunk in data.chunks(chunk_pages * page_size) {
            let first = start_page + done;
            let count = (chunk.len() / page_size) as u64;
            self.program_chunk(target, first, count, chunk)?;
            if verify {
                self.verify_chunk(target, first, count, chunk)?;
            }
            done += count;
            self.progress(OperationKind::Write, done, total);
        }
        info!(pages = total, verified = verify, "Write complete");
        Ok(total)
    }

    fn program_chunk(&self, target: &DumpTarget, first: u64, count: u64, data: &[u8]) -> Result<(), Error> {
        let page_size = target.page_size as usize;
        if target.interface == FlashInterface::SpiNor {
            for (i, page) in data.chunks(page_size).enumerate() {
                let index = first + i as u64;
                for (j, piece) in page.chunks(NOR_PROGRAM_PAGE).enumerate() {
                    let address = to_wire(index * page_size as u64 + (j * NOR_PROGRAM_PAGE) as u64)?;
                    self.request(&Operation::NorWriteEnable)?;
                    let op = Operation::NorPageProgram {
                        address,
                        len: piece.len() as u32,
                    };
                    self.program(&op, piece, index)?;
                }
            }
            return Ok(());
        }

        let payload = match &self.ecc {
            Some(engine) if target.spare_size > 0 => {
                let mut out = Vec::with_capacity(count as usize * (page_size + target.spare_size as usize));
                for page in data.chunks(page_size) {
                    let mut spare = vec![0xFF; target.spare_size as usize];
                    engine.encode_page(page, &mut spare)?;
                    out.extend_from_slice(page);
                    out.extend_from_slice(&spare);
                }
                out
            }
            _ => data.to_vec(),
        };
        let op = self.transfer_op(target, first, count, true)?;
        self.program(&op, &payload, first)
    }

    fn program(&self, op: &Operation, data: &[u8], page: u64) -> Result<(), Error> {
        match self.link()?.request_with_data(op, data, self.config.timeout()) {
            Ok(_) => Ok(()),
            Err(Error::Protocol(ProtocolError::DeviceStatus { status, .. })) => Err(OperationError::WriteFailed {
                page,
                reason: format!("device reported {}", status),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    fn verify_chunk(&self, target: &DumpTarget, first: u64, count: u64, expected: &[u8]) -> Result<(), Error> {
        let plain = DumpTarget {
            spare_size: 0,
            ..target.clone()
        };
        let actual = self.read_chunk(&plain, first, count)?;
        let page_size = target.page_size as usize;
        let mismatch = actual
            .chunks(page_size)
            .zip(expected.chunks(page_size))
            .position(|(a, e)| a != e);
        match mismatch {
            Some(i) => {
                let page = first + i as u64;
                warn!(page = page, "Verify mismatch");
                Err(OperationError::WriteVerifyFailed { page }.into())
            }
            None => Ok(()),
        }
    }
}

impl<O: FlashObserver> Drop for FlashSession<O> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}

fn check_alignment(address: u64, alignment: u64) -> Result<(), Error> {
    if alignment == 0 || address % alignment != 0 {
        return Err(ValidationError::UnalignedAddress { address, alignment }.into());
    }
    Ok(())
}

/// Wire fields are 32 bits wide.
fn to_wire(value: u64) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| {
        OperationError::OutOfRange {
            start: value,
            end: value,
            capacity: u32::MAX as u64,
        }
        .into()
    })
}
