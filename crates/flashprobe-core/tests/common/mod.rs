#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use flashprobe_core::events::{FlashEvent, FlashObserver, OperationKind};
use flashprobe_core::session::{CancelToken, FlashSession, SessionConfig};
use flashprobe_core::transport::EmulatedDevice;

/// Observer that keeps every event and can trip a cancel token once a dump
/// has read a given number of bytes.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<FlashEvent>>,
    trip: Mutex<Option<(CancelToken, u64)>>,
}

impl Recorder {
    pub fn cancel_dump_after(&self, token: CancelToken, bytes: u64) {
        *self.trip.lock().unwrap() = Some((token, bytes));
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn progress(&self, operation: OperationKind) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Progress { operation: op, percent, .. } if op == operation => Some(percent),
                _ => None,
            })
            .collect()
    }

    pub fn retries(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, FlashEvent::Retry { .. }))
            .count()
    }
}

impl FlashObserver for Recorder {
    fn on_event(&self, event: &FlashEvent) {
        if let FlashEvent::Progress {
            operation: OperationKind::Dump,
            current,
            ..
        } = event
        {
            let mut trip = self.trip.lock().unwrap();
            if trip.as_ref().is_some_and(|(_, bytes)| current >= bytes) {
                if let Some((token, _)) = trip.take() {
                    token.cancel();
                }
            }
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        retry_delay_ms: 0,
        timeout_ms: 50,
        erase_timeout_ms: 50,
        ..Default::default()
    }
}

/// Session attached to `dev` with a recording observer.
pub fn session_with(dev: &EmulatedDevice, config: SessionConfig) -> (FlashSession<Recorder>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mut session = FlashSession::with_observer(config, recorder.clone());
    session.attach(Box::new(dev.clone())).unwrap();
    (session, recorder)
}

/// Bytes that differ from page to page and never look erased.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_mul(31).wrapping_add(i as u32 >> 11) as u8 ^ 0x5A).collect()
}
