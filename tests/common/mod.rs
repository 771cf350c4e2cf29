#![allow(dead_code)]

use omnik_bridge::prelude::*;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Factory;

impl Factory {
    pub const WIFI_SERIAL: u32 = 602_123_456;
    pub const INVERTER_SERIAL: &'static str = "NLDN302013212035";
    pub const MAIN_FIRMWARE: &'static str = "NL1-V1.0-0077-4";
    pub const SLAVE_FIRMWARE: &'static str = "V2.0-0024";

    /// A statistics frame as pushed by a real logger, 139 bytes.
    pub fn push_frame() -> Vec<u8> {
        Self::frame_with_len(139)
    }

    pub fn frame_with_len(len: usize) -> Vec<u8> {
        let mut f = vec![0u8; len.max(131)];

        f[0..4].copy_from_slice(&[0x68, 0x7d, 0x41, 0xb0]);
        f[4..8].copy_from_slice(&Self::WIFI_SERIAL.to_le_bytes());
        f[8..15].copy_from_slice(&[0x81, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00]);
        f[15..31].copy_from_slice(Self::INVERTER_SERIAL.as_bytes());

        Self::put_u16(&mut f, 31, 100); // 10.0 C

        Self::put_u16(&mut f, 33, 2455); // 245.5 V
        Self::put_u16(&mut f, 35, 2300);
        Self::put_u16(&mut f, 37, 0);

        Self::put_u16(&mut f, 39, 12); // 1.2 A
        Self::put_u16(&mut f, 41, 11);
        Self::put_u16(&mut f, 43, 0);

        Self::put_u16(&mut f, 45, 15); // 1.5 A
        Self::put_u16(&mut f, 47, 0);
        Self::put_u16(&mut f, 49, 0);

        Self::put_u16(&mut f, 51, 2301); // 230.1 V
        Self::put_u16(&mut f, 53, 0);
        Self::put_u16(&mut f, 55, 0);

        Self::put_u16(&mut f, 57, 5000); // 50.00 Hz
        Self::put_u16(&mut f, 59, 345); // W

        Self::put_u16(&mut f, 69, 1234); // 12.34 kWh
        f[71..75].copy_from_slice(&123_456u32.to_be_bytes()); // 12345.6 kWh
        f[75..79].copy_from_slice(&9876u32.to_be_bytes());

        f[101..101 + Self::MAIN_FIRMWARE.len()].copy_from_slice(Self::MAIN_FIRMWARE.as_bytes());
        f[121..130].copy_from_slice(Self::SLAVE_FIRMWARE.as_bytes());

        f.truncate(len);
        f
    }

    fn put_u16(f: &mut [u8], offset: usize, value: u16) {
        f[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("no free port")
}

pub async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skips events until one matches.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut f: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if f(&event) {
            return event;
        }
    }
}

pub async fn next_message<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Everything already queued, without waiting.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(v) = rx.try_recv() {
        out.push(v);
    }
    out
}

/// Log sink that keeps every line for later inspection.
#[derive(Clone, Default)]
pub struct CapturedLog {
    lines: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLog {
    pub fn logger(&self) -> Logger {
        let lines = self.lines.clone();
        Logger::new(move |level: Level, message: &str| {
            lines.lock().unwrap().push((level, message.to_string()));
        })
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

pub fn start_coordinator(options: CoordinatorOptions) -> (Coordinator, broadcast::Receiver<Event>) {
    let channels = Channels::new();
    let events = channels.subscribe();
    let coordinator = Coordinator::new(channels, options);

    let c = coordinator.clone();
    tokio::spawn(async move { c.start().await });

    (coordinator, events)
}
