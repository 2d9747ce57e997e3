// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for ikvmd
//!
//! End-to-end coverage that crosses module boundaries: a live RFB
//! handshake and update exchange over loopback, gadget tree lifecycle
//! against a scratch directory, input report flows, and the screenshot
//! hand-off contract.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ikvmd::rfb::{Client, Cursor, EventHandler, PixelFormat, Screen};
use ikvmd::server::ClientData;
use ikvmd::{gadget, screenshot, Input, ScreenshotState};

fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// RFB loopback
// ============================================================================

#[derive(Default)]
struct RecordingHandler {
    joined: AtomicUsize,
    left: AtomicUsize,
    update_requests: AtomicUsize,
    keys: Mutex<Vec<(bool, u32)>>,
    pointers: Mutex<Vec<(u8, u16, u16)>>,
}

impl EventHandler<ClientData> for RecordingHandler {
    fn client_joined(&self, _client: &Arc<Client<ClientData>>) {
        self.joined.fetch_add(1, Ordering::SeqCst);
    }

    fn client_left(&self, _client: &Arc<Client<ClientData>>) {
        self.left.fetch_add(1, Ordering::SeqCst);
    }

    fn key_event(&self, down: bool, keysym: u32, _client: &Arc<Client<ClientData>>) {
        self.keys.lock().unwrap().push((down, keysym));
    }

    fn pointer_event(&self, mask: u8, x: u16, y: u16, _client: &Arc<Client<ClientData>>) {
        self.pointers.lock().unwrap().push((mask, x, y));
    }

    fn update_requested(&self, client: &Arc<Client<ClientData>>) {
        self.update_requests.fetch_add(1, Ordering::SeqCst);
        client.data.needs_update.store(true, Ordering::Relaxed);
    }
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("short read from server");
    buf
}

#[test]
fn test_rfb_session_over_loopback() {
    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 48;

    let screen = Arc::new(
        Screen::<ClientData>::new(
            0,
            "ikvmd test",
            WIDTH,
            HEIGHT,
            PixelFormat::rgb888(),
            Cursor::pointer_arrow(),
        )
        .unwrap(),
    );
    let addr = screen.local_addr().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let stop = Arc::new(AtomicBool::new(false));

    let pump = {
        let screen = screen.clone();
        let handler = handler.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                screen.process_events(Duration::from_millis(10), &*handler);
            }
        })
    };

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // version handshake
    assert_eq!(read_exact(&mut stream, 12), b"RFB 003.008\n");
    stream.write_all(b"RFB 003.008\n").unwrap();

    // security: one type offered, None
    assert_eq!(read_exact(&mut stream, 2), vec![1, 1]);
    stream.write_all(&[1]).unwrap();
    assert_eq!(read_exact(&mut stream, 4), vec![0, 0, 0, 0]);

    // ClientInit (shared)
    stream.write_all(&[1]).unwrap();

    // ServerInit
    let init = read_exact(&mut stream, 24);
    assert_eq!(u16::from_be_bytes([init[0], init[1]]) as u32, WIDTH);
    assert_eq!(u16::from_be_bytes([init[2], init[3]]) as u32, HEIGHT);
    assert_eq!(init[4], 32); // bits per pixel
    let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
    assert_eq!(read_exact(&mut stream, name_len), b"ikvmd test");

    wait_until("client join hook", || {
        handler.joined.load(Ordering::SeqCst) == 1
    });
    assert_eq!(screen.client_count(), 1);

    // request an update; the fresh framebuffer arrives as one raw rect
    let request = [3u8, 0, 0, 0, 0, 0, 0, 64, 0, 48];
    stream.write_all(&request).unwrap();

    let header = read_exact(&mut stream, 4);
    assert_eq!(header, vec![0, 0, 0, 1]);
    let rect = read_exact(&mut stream, 12);
    assert_eq!(u16::from_be_bytes([rect[0], rect[1]]), 0);
    assert_eq!(u16::from_be_bytes([rect[4], rect[5]]) as u32, WIDTH);
    assert_eq!(u16::from_be_bytes([rect[6], rect[7]]) as u32, HEIGHT);
    assert_eq!(&rect[8..12], &0i32.to_be_bytes()); // raw encoding
    let pixels = read_exact(&mut stream, (WIDTH * HEIGHT * 4) as usize);
    assert!(pixels.iter().all(|&b| b == 0));
    assert!(handler.update_requests.load(Ordering::SeqCst) >= 1);

    // key and pointer events reach the hooks
    stream.write_all(&[4, 1, 0, 0, 0, 0, 0, 0x41]).unwrap();
    stream.write_all(&[4, 0, 0, 0, 0, 0, 0, 0x41]).unwrap();
    wait_until("key events", || handler.keys.lock().unwrap().len() == 2);
    assert_eq!(
        *handler.keys.lock().unwrap(),
        vec![(true, 0x41), (false, 0x41)]
    );

    stream.write_all(&[5, 1, 0, 32, 0, 24]).unwrap();
    wait_until("pointer event", || {
        !handler.pointers.lock().unwrap().is_empty()
    });
    assert_eq!(*handler.pointers.lock().unwrap(), vec![(1, 32, 24)]);

    // disconnect is observed and the client reaped
    drop(stream);
    wait_until("client leave hook", || {
        handler.left.load(Ordering::SeqCst) == 1
    });
    assert_eq!(screen.client_count(), 0);

    stop.store(true, Ordering::SeqCst);
    pump.join().unwrap();
}

#[test]
fn test_framebuffer_tracks_resize() {
    let screen = Screen::<ClientData>::new(
        0,
        "resize",
        640,
        480,
        PixelFormat::rgb888(),
        Cursor::pointer_arrow(),
    )
    .unwrap();

    assert_eq!(screen.framebuffer_len(), 640 * 480 * 4);
    screen.set_framebuffer(1280, 720);
    assert_eq!(screen.framebuffer_len(), 1280 * 720 * 4);
    assert_eq!(screen.width(), 1280);
    assert_eq!(screen.height(), 720);
}

// ============================================================================
// Gadget lifecycle
// ============================================================================

#[test]
fn test_gadget_lifecycle() {
    let root = std::env::temp_dir().join(format!("ikvmd-itest-{}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    let gadget_dir = root.join("obmc_hid");

    gadget::create_hid(&gadget_dir).unwrap();
    assert!(gadget_dir.join("configs/c.1/hid.0").exists());
    assert!(gadget_dir.join("configs/c.1/hid.1").exists());
    assert_eq!(
        fs::read(gadget_dir.join("functions/hid.0/report_desc"))
            .unwrap()
            .len(),
        63
    );
    assert_eq!(
        fs::read(gadget_dir.join("functions/hid.1/report_desc"))
            .unwrap()
            .len(),
        76
    );

    gadget::destroy_hid(&gadget_dir).unwrap();
    assert!(!gadget_dir.exists());

    let _ = fs::remove_dir_all(&root);
}

// ============================================================================
// Input report flows
// ============================================================================

#[test]
fn test_typing_a_produces_expected_reports() {
    let input = Input::new(
        PathBuf::from("/dev/hidg0"),
        PathBuf::from("/dev/hidg1"),
        None,
    );

    input.key_event(true, 'A' as u32);
    assert_eq!(
        input.keyboard_report(),
        [0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
    input.key_event(false, 'A' as u32);
    assert_eq!(input.keyboard_report(), [0; 8]);
}

#[test]
fn test_balanced_sequences_return_to_idle() {
    let input = Input::new(
        PathBuf::from("/dev/hidg0"),
        PathBuf::from("/dev/hidg1"),
        None,
    );

    // interleaved letters, digits, and modifiers
    let keys = ['h' as u32, 'i' as u32, '1' as u32, 0xffe1, 0xffe9, 0xff0d];
    for &k in &keys {
        input.key_event(true, k);
    }
    for &k in keys.iter().rev() {
        input.key_event(false, k);
    }
    assert_eq!(input.keyboard_report(), [0; 8]);
}

#[test]
fn test_pointer_event_matches_documented_encoding() {
    let input = Input::new(
        PathBuf::from("/dev/hidg0"),
        PathBuf::from("/dev/hidg1"),
        None,
    );

    input.pointer_event(1, 960, 540, 1920, 1080);
    assert_eq!(
        input.pointer_report(),
        [0x01, 0x00, 0x40, 0x00, 0x40, 0x00]
    );
}

// ============================================================================
// Screenshot hand-off
// ============================================================================

#[test]
fn test_screenshot_busy_until_serviced() {
    let state = ScreenshotState::new();

    // back-to-back calls: first gets the path, second the busy literal
    assert_eq!(state.request(), screenshot::SCREENSHOT_PATH);
    assert_eq!(state.request(), screenshot::BUSY_REPLY);

    // the capture loop services and clears the request
    assert!(state.pending());
    assert_eq!(state.path(), PathBuf::from(screenshot::SCREENSHOT_PATH));
    state.clear();

    assert_eq!(state.request(), screenshot::SCREENSHOT_PATH);
}
