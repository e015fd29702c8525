mod common;

use std::sync::Arc;

use common::{Recorder, fast_config};
use flashprobe_core::chip::{DeviceCapabilities, FlashInterface};
use flashprobe_core::error::Error;
use flashprobe_core::events::{FlashEvent, LogLevel};
use flashprobe_core::protocol::{Command, Operation, Reply};
use flashprobe_core::session::{CancelToken, DeviceState, DumpOutcome, FlashSession, SessionConfig};
use flashprobe_core::transport::{MockTransport, TransportError};

fn nor_only() -> u32 {
    DeviceCapabilities {
        spi_nor: true,
        ..Default::default()
    }
    .to_bitmap()
}

/// Replies for ping, version and capabilities.
fn queue_handshake(mock: &MockTransport, caps: u32) {
    mock.queue_reply(Reply::ok(Command::Ping).with_payload(b"PONG"));
    mock.queue_reply(Reply::ok(Command::GetVersion).with_payload(&[2, 0, 1]));
    mock.queue_reply(Reply::ok(Command::GetCapabilities).with_payload(&caps.to_le_bytes()));
}

fn queue_nor_identify(mock: &MockTransport, jedec_id: &[u8], sr1: u8) {
    mock.queue_reply(Reply::ok(Command::SetInterface));
    mock.queue_reply_with_data(Reply::ok(Command::NorReadJedecId), jedec_id);
    mock.queue_reply(Reply::ok(Command::NorReadStatus1).with_payload(&[sr1]));
    mock.queue_reply(Reply::ok(Command::NorReadStatus2).with_payload(&[0x00]));
}

fn session() -> (FlashSession<Recorder>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (FlashSession::with_observer(fast_config(), recorder.clone()), recorder)
}

#[test]
fn test_handshake_command_sequence() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let (mut session, _) = session();

    session.attach(Box::new(mock.clone())).unwrap();
    assert_eq!(session.state(), DeviceState::Ready);
    assert_eq!(session.firmware_version(), Some("2.0.1"));
    assert_eq!(session.capabilities().unwrap().to_bitmap(), nor_only());
    assert_eq!(session.chip_info().unwrap().model, "W25Q128JV");
    assert_eq!(mock.pending_replies(), 0);

    let sent = mock.sent_operations();
    assert_eq!(
        sent,
        vec![
            Operation::Ping,
            Operation::GetVersion,
            Operation::GetCapabilities,
            Operation::SetInterface {
                interface: FlashInterface::SpiNor
            },
            Operation::NorReadJedecId,
            Operation::NorReadStatus1,
            Operation::NorReadStatus2,
        ]
    );
}

#[test]
fn test_unknown_chip_gets_conservative_defaults() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0x12, 0x34, 0x56], 0x00);
    let (mut session, recorder) = session();

    session.attach(Box::new(mock.clone())).unwrap();
    let chip = session.chip_info().unwrap();
    assert!(!chip.resolved);
    assert_eq!(chip.manufacturer, "Unknown");
    assert_eq!(chip.size_mb, 0);
    assert_eq!(chip.page_size, 256);

    let events = recorder.events();
    assert!(events.iter().any(|e| matches!(
        e,
        FlashEvent::Log {
            level: LogLevel::Warn,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        FlashEvent::ChipIdentified { resolved: false, .. }
    )));
}

#[test]
fn test_handshake_timeout_leaves_session_disconnected() {
    let mock = MockTransport::new();
    mock.queue_timeout();
    let (mut session, _) = session();

    let err = session.attach(Box::new(mock.clone())).unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Timeout { .. })));
    assert_eq!(session.state(), DeviceState::Disconnected);
    assert!(session.firmware_version().is_none());
}

#[test]
fn test_programmer_without_interfaces_is_rejected() {
    let mock = MockTransport::new();
    queue_handshake(&mock, 0);
    let (mut session, _) = session();

    let err = session.attach(Box::new(mock.clone())).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(session.state(), DeviceState::Disconnected);
}

#[test]
fn test_short_data_phase_is_malformed() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let recorder = Arc::new(Recorder::default());
    let config = SessionConfig {
        max_retries: 0,
        ..fast_config()
    };
    let mut session = FlashSession::with_observer(config, recorder);
    session.attach(Box::new(mock.clone())).unwrap();
    mock.clear_sent();

    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0xAB; 100]);
    let err = session.dump(0, 1, 256, &CancelToken::new()).unwrap_err();
    let Error::DumpAborted { source, .. } = err else {
        panic!("expected an aborted dump");
    };
    assert!(matches!(
        *source,
        Error::Protocol(flashprobe_core::protocol::ProtocolError::MalformedPayload { .. })
    ));
    assert_eq!(mock.sent_operations(), vec![Operation::NorRead { address: 0, len: 256 }]);
}

#[test]
fn test_dump_splits_into_chunks() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let recorder = Arc::new(Recorder::default());
    let config = SessionConfig {
        chunk_pages: 2,
        ..fast_config()
    };
    let mut session = FlashSession::with_observer(config, recorder);
    session.attach(Box::new(mock.clone())).unwrap();
    mock.clear_sent();

    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0x11; 512]);
    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0x22; 256]);
    let outcome = session.dump(4, 3, 256, &CancelToken::new()).unwrap();
    let DumpOutcome::Complete(report) = outcome else {
        panic!("dump was cancelled");
    };
    assert_eq!(report.data.len(), 768);
    assert_eq!(report.data[511], 0x11);
    assert_eq!(report.data[512], 0x22);
    assert_eq!(
        mock.sent_operations(),
        vec![
            Operation::NorRead {
                address: 0x400,
                len: 512
            },
            Operation::NorRead {
                address: 0x600,
                len: 256
            },
        ]
    );
}

#[test]
fn test_erase_sector_sends_write_enable_first() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let (mut session, _) = session();
    session.attach(Box::new(mock.clone())).unwrap();
    mock.clear_sent();

    mock.queue_reply(Reply::ok(Command::NorWriteEnable));
    mock.queue_reply(Reply::ok(Command::NorSectorErase));
    session.erase_sector(0x3000).unwrap();
    assert_eq!(
        mock.sent_operations(),
        vec![
            Operation::NorWriteEnable,
            Operation::NorSectorErase { address: 0x3000 }
        ]
    );
}

#[test]
fn test_lost_link_during_erase() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let (mut session, _) = session();
    session.attach(Box::new(mock.clone())).unwrap();

    mock.queue_disconnect();
    let err = session.erase_block(0).unwrap_err();
    assert!(err.is_disconnect());
    assert_eq!(session.state(), DeviceState::Disconnected);
}

#[test]
fn test_late_reply_after_timeout_does_not_shift_pages() {
    let mock = MockTransport::new();
    queue_handshake(&mock, nor_only());
    queue_nor_identify(&mock, &[0xEF, 0x40, 0x18], 0x00);
    let recorder = Arc::new(Recorder::default());
    let config = SessionConfig {
        chunk_pages: 1,
        ..fast_config()
    };
    let mut session = FlashSession::with_observer(config, recorder.clone());
    session.attach(Box::new(mock.clone())).unwrap();
    mock.clear_sent();

    // Page 0 times out, then its reply shows up ahead of the retry's.
    mock.queue_timeout();
    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0x11; 256]);
    mock.queue_reply(Reply::ok(Command::Ping).with_payload(b"PONG"));
    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0x11; 256]);
    mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0x22; 256]);

    let outcome = session.dump(0, 2, 256, &CancelToken::new()).unwrap();
    let DumpOutcome::Complete(report) = outcome else {
        panic!("dump was cancelled");
    };
    assert_eq!(&report.data[..256], &[0x11; 256][..]);
    assert_eq!(&report.data[256..], &[0x22; 256][..]);
    assert_eq!(mock.pending_replies(), 0);
    assert_eq!(recorder.retries(), 1);
    assert_eq!(
        mock.sent_operations(),
        vec![
            Operation::NorRead { address: 0, len: 256 },
            Operation::Ping,
            Operation::NorRead { address: 0, len: 256 },
            Operation::NorRead {
                address: 0x100,
                len: 256
            },
        ]
    );
}
