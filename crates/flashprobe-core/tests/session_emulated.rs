mod common;

use common::{Recorder, fast_config, pattern, session_with};
use flashprobe_core::chip::{ChipError, FlashInterface, UfsLunType};
use flashprobe_core::ecc::{EccScheme, EccStatus};
use flashprobe_core::error::{Error, OperationError, ValidationError};
use flashprobe_core::events::{FlashEvent, OperationKind};
use flashprobe_core::protocol::{ProtocolError, Status};
use flashprobe_core::session::{CancelToken, DeviceState, DumpOutcome, EccConfig, EraseOutcome, FlashSession, SessionConfig};
use flashprobe_core::transport::{EmulatedDevice, EmulatorConfig, FaultPlan, TransportError};

const PAGE: u32 = 2048;
const PAGES_PER_BLOCK: u64 = 64;

fn complete(outcome: DumpOutcome) -> flashprobe_core::session::DumpReport {
    match outcome {
        DumpOutcome::Complete(report) => report,
        DumpOutcome::Cancelled(partial) => panic!("dump cancelled at 0x{:X}", partial.state.next_offset()),
    }
}

fn ecc_config(scheme: EccScheme) -> SessionConfig {
    SessionConfig {
        ecc: EccConfig {
            scheme,
            ..Default::default()
        },
        ..fast_config()
    }
}

#[test]
fn test_connect_identifies_parallel_nand() {
    let dev = EmulatedDevice::default();
    let (session, recorder) = session_with(&dev, fast_config());

    assert_eq!(session.state(), DeviceState::Ready);
    assert_eq!(session.firmware_version(), Some("1.2.0"));
    let chip = session.chip_info().unwrap();
    assert_eq!(chip.interface, FlashInterface::ParallelNand);
    assert_eq!(chip.model, "K9F1G08U0B");
    assert!(chip.resolved);
    assert_eq!(chip.page_size, PAGE);
    assert_eq!(chip.oob_size, 64);
    assert_eq!(chip.capacity_bytes(), 128 * 1024 * 1024);
    assert_eq!(dev.interface(), Some(FlashInterface::ParallelNand));

    let events = recorder.events();
    assert!(events.iter().any(|e| matches!(e, FlashEvent::DeviceConnected { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        FlashEvent::ChipIdentified { resolved: true, .. }
    )));
}

#[test]
fn test_operations_require_connection() {
    let mut session = FlashSession::with_observer(fast_config(), std::sync::Arc::new(Recorder::default()));
    let err = session.dump(0, 1, PAGE, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert_eq!(session.state(), DeviceState::Disconnected);
}

#[test]
fn test_dump_returns_exact_length_with_monotonic_progress() {
    let dev = EmulatedDevice::default();
    let data = pattern(10 * PAGE as usize);
    dev.load(FlashInterface::ParallelNand, 0, &data);
    let config = SessionConfig {
        chunk_pages: 4,
        ..fast_config()
    };
    let (mut session, recorder) = session_with(&dev, config);

    let report = complete(session.dump(0, 10, PAGE, &CancelToken::new()).unwrap());
    assert_eq!(report.data.len(), 10 * PAGE as usize);
    assert_eq!(report.data, data);
    assert!(report.page_ecc.is_empty());

    let progress = recorder.progress(OperationKind::Dump);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_dump_outside_chip_is_rejected() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    let last_page = 1024 * PAGES_PER_BLOCK - 1;
    dev.clear_log();

    let err = session.dump(last_page, 2, PAGE, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Operation(OperationError::OutOfRange { .. })));
    assert!(dev.command_log().is_empty());
}

#[test]
fn test_dump_retries_dropped_and_busy_replies() {
    let dev = EmulatedDevice::default();
    let data = pattern(4 * PAGE as usize);
    dev.load(FlashInterface::ParallelNand, 0, &data);
    let (mut session, recorder) = session_with(&dev, fast_config());
    dev.set_faults(FaultPlan {
        dropped_replies: 1,
        busy_replies: 1,
        ..Default::default()
    });

    let report = complete(session.dump(0, 4, PAGE, &CancelToken::new()).unwrap());
    assert_eq!(report.data, data);
    assert_eq!(recorder.retries(), 2);
}

#[test]
fn test_dump_gives_up_after_max_retries() {
    let dev = EmulatedDevice::default();
    let config = SessionConfig {
        max_retries: 2,
        chunk_pages: 2,
        ..fast_config()
    };
    let (mut session, recorder) = session_with(&dev, config);
    dev.set_faults(FaultPlan {
        busy_replies: 10,
        ..Default::default()
    });

    let err = session.dump(0, 4, PAGE, &CancelToken::new()).unwrap_err();
    match &err {
        Error::DumpAborted { partial, source } => {
            assert!(partial.data.is_empty());
            assert_eq!(partial.state.attempts, 2);
            assert!(matches!(
                **source,
                Error::Protocol(ProtocolError::DeviceStatus {
                    status: Status::Busy,
                    ..
                })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(recorder.retries(), 2);
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_cancel_then_resume_matches_full_dump() {
    let dev = EmulatedDevice::default();
    let data = pattern(16 * PAGE as usize);
    dev.load(FlashInterface::ParallelNand, 0, &data);
    let config = SessionConfig {
        chunk_pages: 4,
        ..fast_config()
    };
    let (mut session, recorder) = session_with(&dev, config);

    let cancel = CancelToken::new();
    recorder.cancel_dump_after(cancel.clone(), 4 * PAGE as u64);
    let partial = match session.dump(0, 16, PAGE, &cancel).unwrap() {
        DumpOutcome::Cancelled(partial) => partial,
        DumpOutcome::Complete(_) => panic!("dump was not cancelled"),
    };
    assert_eq!(partial.data, data[..4 * PAGE as usize]);
    assert_eq!(partial.state.next_offset(), 4 * PAGE as u64);
    assert!(
        recorder
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::Cancelled { operation: OperationKind::Dump, .. }))
    );
    assert_eq!(session.state(), DeviceState::Ready);

    cancel.reset();
    let report = complete(session.resume_dump(partial, &cancel).unwrap());
    assert_eq!(report.data, data);
}

#[test]
fn test_hamming_corrects_weak_bit_after_write() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, ecc_config(EccScheme::Hamming { codeword_size: 256 }));
    dev.set_faults(FaultPlan {
        weak_bits: vec![100],
        ..Default::default()
    });

    let page = pattern(PAGE as usize);
    assert_eq!(session.write(0, &page, false).unwrap(), 1);
    assert_ne!(dev.contents(FlashInterface::ParallelNand, 0, PAGE as usize), page);

    let report = complete(session.dump(0, 1, PAGE, &CancelToken::new()).unwrap());
    assert_eq!(report.data, page);
    assert_eq!(report.page_ecc.len(), 1);
    assert_eq!(report.page_ecc[0].status, EccStatus::Corrected(1));
    assert_eq!(report.corrected_bits(), 1);
    assert!(report.bad_block_candidates.is_empty());
}

#[test]
fn test_bch_corrects_flips_in_separate_codewords() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, ecc_config(EccScheme::Bch { strength: 4 }));

    let data = pattern(2 * PAGE as usize);
    session.write(0, &data, true).unwrap();
    dev.flip_bit(FlashInterface::ParallelNand, 10, 3);
    dev.flip_bit(FlashInterface::ParallelNand, 600, 6);
    dev.flip_bit(FlashInterface::ParallelNand, PAGE as u64 + 5, 0);

    let report = complete(session.dump(0, 2, PAGE, &CancelToken::new()).unwrap());
    assert_eq!(report.data, data);
    assert_eq!(report.page_ecc[0].status, EccStatus::Corrected(2));
    assert_eq!(report.page_ecc[1].status, EccStatus::Corrected(1));
}

#[test]
fn test_uncorrectable_page_marks_block() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, ecc_config(EccScheme::Hamming { codeword_size: 256 }));
    let start = PAGES_PER_BLOCK;
    let page = pattern(PAGE as usize);
    session.write(start, &page, false).unwrap();

    let base = start * PAGE as u64;
    dev.flip_bit(FlashInterface::ParallelNand, base + 3, 1);
    dev.flip_bit(FlashInterface::ParallelNand, base + 40, 5);

    let report = complete(session.dump(start, 1, PAGE, &CancelToken::new()).unwrap());
    assert_eq!(report.page_ecc[0].status, EccStatus::Uncorrectable);
    assert_eq!(report.bad_block_candidates, vec![1]);
    assert_eq!(report.uncorrectable_pages().collect::<Vec<_>>(), vec![start]);
    assert_eq!(report.ensure_correctable(), Err(ChipError::UncorrectableEcc { page: start }));
    // Raw bytes are kept when correction is impossible.
    assert_ne!(report.data, page);
}

#[test]
fn test_ecc_rejects_mismatched_page_size() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, ecc_config(EccScheme::Bch { strength: 4 }));
    let err = session.dump(0, 1, 1000, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Ecc(_)));
}

#[test]
fn test_write_verify_roundtrip_and_length_check() {
    let dev = EmulatedDevice::default();
    let (mut session, recorder) = session_with(&dev, fast_config());

    let data = pattern(3 * PAGE as usize);
    assert_eq!(session.write(2, &data, true).unwrap(), 3);
    assert_eq!(dev.contents(FlashInterface::ParallelNand, 2 * PAGE as u64, data.len()), data);
    assert_eq!(recorder.progress(OperationKind::Write).last(), Some(&100));

    let err = session.write(0, &data[..100], false).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::UnalignedLength { .. })));
}

#[test]
fn test_write_verify_detects_weak_bit() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    dev.set_faults(FaultPlan {
        weak_bits: vec![PAGE as u64 + 7],
        ..Default::default()
    });

    let err = session.write(0, &pattern(2 * PAGE as usize), true).unwrap_err();
    assert!(matches!(err, Error::Operation(OperationError::WriteVerifyFailed { page: 1 })));
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_unconfirmed_chip_erase_sends_nothing() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    dev.clear_log();

    let err = session.erase_chip(false, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Operation(OperationError::NotConfirmed)));
    assert!(dev.command_log().is_empty());
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_nand_block_and_chip_erase() {
    let dev = EmulatedDevice::default();
    let (mut session, recorder) = session_with(&dev, fast_config());
    let block = PAGES_PER_BLOCK * PAGE as u64;
    dev.load(FlashInterface::ParallelNand, block, &pattern(PAGE as usize));

    let err = session.erase_block(block + PAGE as u64).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::UnalignedAddress { .. })));

    session.erase_block(block).unwrap();
    assert!(dev.contents(FlashInterface::ParallelNand, block, PAGE as usize).iter().all(|&b| b == 0xFF));

    dev.load(FlashInterface::ParallelNand, 0, &pattern(PAGE as usize));
    let outcome = session.erase_chip(true, &CancelToken::new()).unwrap();
    assert_eq!(outcome, EraseOutcome::Complete { blocks: 1024 });
    assert!(dev.contents(FlashInterface::ParallelNand, 0, PAGE as usize).iter().all(|&b| b == 0xFF));
    let progress = recorder.progress(OperationKind::Erase);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));
}

#[test]
fn test_cancelled_chip_erase() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = session.erase_chip(true, &cancel).unwrap();
    assert_eq!(outcome, EraseOutcome::Cancelled { erased_blocks: 0 });
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_failed_erase_is_reported() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    dev.set_faults(FaultPlan {
        fail_erase: true,
        ..Default::default()
    });

    let err = session.erase_block(0).unwrap_err();
    assert!(matches!(
        err,
        Error::Operation(OperationError::EraseFailed { address: 0, .. })
    ));
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_disconnect_mid_dump_keeps_partial_data() {
    let dev = EmulatedDevice::default();
    let data = pattern(8 * PAGE as usize);
    dev.load(FlashInterface::ParallelNand, 0, &data);
    let config = SessionConfig {
        chunk_pages: 2,
        ..fast_config()
    };
    let (mut session, recorder) = session_with(&dev, config);
    dev.set_faults(FaultPlan {
        disconnect_after: Some(2),
        ..Default::default()
    });

    let err = session.dump(0, 8, PAGE, &CancelToken::new()).unwrap_err();
    assert!(err.is_disconnect());
    let partial = err.partial_dump().unwrap();
    assert_eq!(partial.data, data[..4 * PAGE as usize]);
    assert_eq!(partial.state.next_chunk, 2);

    assert_eq!(session.state(), DeviceState::Disconnected);
    assert!(session.chip_info().is_none());
    assert!(
        recorder
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::DeviceDisconnected))
    );
}

#[test]
fn test_desynced_reply_aborts_dump() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    dev.set_faults(FaultPlan {
        desync_next: true,
        ..Default::default()
    });

    let err = session.dump(0, 1, PAGE, &CancelToken::new()).unwrap_err();
    match err {
        Error::DumpAborted { source, .. } => {
            assert!(matches!(*source, Error::Protocol(ProtocolError::Desync { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_nor_unlock_then_write_and_erase() {
    let mut emulator = EmulatorConfig::default();
    emulator.nor.sr1 = 0x1C;
    let dev = EmulatedDevice::new(emulator);
    let config = SessionConfig {
        interface: Some(FlashInterface::SpiNor),
        ..fast_config()
    };
    let (mut session, _) = session_with(&dev, config);

    let chip = session.chip_info().unwrap();
    assert_eq!(chip.model, "W25Q128JV");
    assert_eq!(chip.page_size, 256);
    assert!(chip.protection.unwrap().any());

    let data = pattern(512);
    let err = session.write(16, &data, false).unwrap_err();
    assert!(matches!(err, Error::Operation(OperationError::WriteFailed { page: 16, .. })));

    let remaining = session.unlock_all().unwrap();
    assert!(remaining.is_clear());
    assert_eq!(dev.status_registers(), (0, 0));
    assert!(session.chip_info().unwrap().protection.unwrap().is_clear());

    assert_eq!(session.write(16, &data, true).unwrap(), 2);
    assert_eq!(dev.contents(FlashInterface::SpiNor, 0x1000, 512), data);

    let err = session.erase_sector(0x1001).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnalignedAddress { alignment: 4096, .. })
    ));
    session.erase_sector(0x1000).unwrap();
    assert!(dev.contents(FlashInterface::SpiNor, 0x1000, 512).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_nor_dump_after_interface_switch() {
    let dev = EmulatedDevice::default();
    let data = pattern(1024);
    dev.load(FlashInterface::SpiNor, 0x2000, &data);
    let (mut session, recorder) = session_with(&dev, fast_config());
    recorder.clear();

    session.set_interface(FlashInterface::SpiNor).unwrap();
    assert_eq!(session.chip_info().unwrap().interface, FlashInterface::SpiNor);
    assert!(
        recorder
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::Complete { operation: OperationKind::Identify }))
    );

    let report = complete(session.dump(0x20, 4, 256, &CancelToken::new()).unwrap());
    assert_eq!(report.data, data);
}

#[test]
fn test_unlock_unsupported_on_parallel_nand() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    let err = session.unlock_all().unwrap_err();
    assert!(matches!(err, Error::Chip(_)));
    assert_eq!(session.state(), DeviceState::Ready);
}

#[test]
fn test_spi_nand_unlock_clears_lock_register() {
    let mut emulator = EmulatorConfig::default();
    emulator.spi_nand.block_lock = 0x38;
    let dev = EmulatedDevice::new(emulator);
    let config = SessionConfig {
        interface: Some(FlashInterface::SpiNand),
        ..fast_config()
    };
    let (mut session, _) = session_with(&dev, config);
    assert!(session.chip_info().unwrap().protection.unwrap().any());

    session.unlock_all().unwrap();
    assert_eq!(dev.block_lock() & 0x3E, 0);
}

#[test]
fn test_ufs_lun_selection_and_resume_guard() {
    let dev = EmulatedDevice::default();
    let boot = pattern(2 * 4096);
    dev.load_lun(UfsLunType::BootA, 0, &boot);
    let config = SessionConfig {
        interface: Some(FlashInterface::Ufs),
        ..fast_config()
    };
    let (mut session, _) = session_with(&dev, config);
    assert_eq!(session.selected_lun(), Some(UfsLunType::UserData));

    let err = session.dump(0, 1, 2048, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::InvalidPageSize { unit: 4096, .. })));

    let cancel = CancelToken::new();
    cancel.cancel();
    let partial = match session.dump(0, 4, 4096, &cancel).unwrap() {
        DumpOutcome::Cancelled(partial) => partial,
        DumpOutcome::Complete(_) => panic!("dump was not cancelled"),
    };

    session.select_ufs_lun(UfsLunType::BootA).unwrap();
    assert_eq!(session.selected_lun(), Some(UfsLunType::BootA));
    assert_eq!(dev.selected_lun(), UfsLunType::BootA.lun_id());

    cancel.reset();
    let err = session.resume_dump(partial, &cancel).unwrap_err();
    assert!(matches!(err, Error::Operation(OperationError::ResumeTargetMismatch(_))));

    let report = complete(session.dump(0, 2, 4096, &cancel).unwrap());
    assert_eq!(report.data, boot);
}

#[test]
fn test_ufs_rejects_disabled_and_protected_luns() {
    let mut emulator = EmulatorConfig::default();
    emulator.ufs.luns[1].write_protected = true;
    emulator.ufs.luns[2].enabled = false;
    let dev = EmulatedDevice::new(emulator);
    let config = SessionConfig {
        interface: Some(FlashInterface::Ufs),
        ..fast_config()
    };
    let (mut session, _) = session_with(&dev, config);

    let err = session.select_ufs_lun(UfsLunType::BootB).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::InvalidLun {
            lun: UfsLunType::BootB,
            ..
        })
    ));
    assert_eq!(session.selected_lun(), Some(UfsLunType::UserData));

    session.select_ufs_lun(UfsLunType::BootA).unwrap();
    let err = session.write(0, &pattern(4096), false).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::InvalidLun {
            lun: UfsLunType::BootA,
            ..
        })
    ));

    let err = session.erase_chip(true, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Chip(_)));
}

#[test]
fn test_lun_selection_needs_ufs() {
    let dev = EmulatedDevice::default();
    let (mut session, _) = session_with(&dev, fast_config());
    let err = session.select_ufs_lun(UfsLunType::BootA).unwrap_err();
    assert!(matches!(err, Error::Chip(_)));
}

#[test]
fn test_emmc_dump_and_sector_erase() {
    let dev = EmulatedDevice::default();
    let data = pattern(4096);
    dev.load(FlashInterface::Emmc, 0, &data);
    let config = SessionConfig {
        interface: Some(FlashInterface::Emmc),
        ..fast_config()
    };
    let (mut session, _) = session_with(&dev, config);
    assert_eq!(session.chip_info().unwrap().capacity_bytes(), 256 * 1024 * 1024);

    let err = session.dump(0, 1, 1000, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::InvalidPageSize { unit: 512, .. })));

    let report = complete(session.dump(0, 2, 2048, &CancelToken::new()).unwrap());
    assert_eq!(report.data, data);

    session.erase_sector(512).unwrap();
    let after = dev.contents(FlashInterface::Emmc, 0, 1024);
    assert_eq!(after[..512], data[..512]);
    assert!(after[512..].iter().all(|&b| b == 0x00 || b == 0xFF));
}

#[test]
fn test_lost_device_during_handshake() {
    let dev = EmulatedDevice::default();
    dev.disconnect();
    let recorder = std::sync::Arc::new(Recorder::default());
    let mut session = FlashSession::with_observer(fast_config(), recorder);
    let err = session.attach(Box::new(dev.clone())).unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Disconnected)));
    assert_eq!(session.state(), DeviceState::Disconnected);
}
