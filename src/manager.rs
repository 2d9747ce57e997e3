// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! Daemon coordination
//!
//! Two long-lived threads phase-locked by a condition-variable
//! rendezvous: the server thread blocks inside the RFB event pump while
//! the status thread drives capture, so a resize never races an
//! in-flight encode. The status thread only enters the resize path once
//! the server thread has parked after a pump.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{error, info};

use crate::input::Input;
use crate::screenshot::ScreenshotState;
use crate::server::Server;
use crate::video::Video;
use crate::Result;

/// Daemon configuration assembled from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capture frame rate (already sanitized to 1..=60).
    pub frame_rate: u32,
    /// JPEG chroma subsampling selector: 0 = 4:4:4, 1 = 4:2:0.
    pub subsampling: u32,
    /// Capture format selector: 0 = driver default, 1 = hextile stream.
    pub pixel_format: u32,
    pub keyboard_path: PathBuf,
    pub pointer_path: PathBuf,
    pub udc_name: Option<String>,
    pub video_path: PathBuf,
    /// Per-client frame checksum dedup.
    pub calc_frame_crc: bool,
    /// RFB listen port.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            subsampling: 0,
            pixel_format: 0,
            keyboard_path: PathBuf::from("/dev/hidg0"),
            pointer_path: PathBuf::from("/dev/hidg1"),
            udc_name: None,
            video_path: PathBuf::from("/dev/video0"),
            calc_frame_crc: false,
            port: 5900,
        }
    }
}

/// Clamp a raw frame-rate argument; out-of-range values (including 0,
/// which would break the pump budget arithmetic) fall back to 30.
pub fn sanitize_frame_rate(raw: i64) -> u32 {
    if (1..=60).contains(&raw) {
        raw as u32
    } else {
        30
    }
}

struct SyncState {
    server_done: bool,
    video_done: bool,
}

/// The server/status rendezvous. `video_done` stays set outside of a
/// resize, so the server thread only ever parks while the status thread
/// is reconfiguring the capture pipeline.
struct Rendezvous {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                server_done: false,
                video_done: true,
            }),
            cond: Condvar::new(),
        }
    }

    fn set_server_done(&self) {
        let mut state = self.state.lock().expect("Failed to lock rendezvous mutex: another thread panicked while holding the lock");
        state.server_done = true;
        self.cond.notify_all();
    }

    fn set_video_done(&self) {
        let mut state = self.state.lock().expect("Failed to lock rendezvous mutex: another thread panicked while holding the lock");
        state.video_done = true;
        self.cond.notify_all();
    }

    fn clear_video_done(&self) {
        self.state.lock().expect("Failed to lock rendezvous mutex: another thread panicked while holding the lock").video_done = false;
    }

    /// Wait for the server thread to finish a pump; consumes the signal.
    fn wait_server(&self) {
        let mut state = self.state.lock().expect("Failed to lock rendezvous mutex: another thread panicked while holding the lock");
        while !state.server_done {
            state = self.cond.wait(state).expect("Failed to reacquire rendezvous mutex: another thread panicked while holding the lock");
        }
        state.server_done = false;
    }

    /// Wait for the capture side to be quiescent; the signal is level-
    /// triggered and deliberately not consumed.
    fn wait_video(&self) {
        let mut state = self.state.lock().expect("Failed to lock rendezvous mutex: another thread panicked while holding the lock");
        while !state.video_done {
            state = self.cond.wait(state).expect("Failed to reacquire rendezvous mutex: another thread panicked while holding the lock");
        }
    }
}

/// Owns the subsystems and runs the two coordination loops.
pub struct Manager {
    input: Arc<Input>,
    video: Arc<Video>,
    server: Arc<Server>,
    screenshot: Arc<ScreenshotState>,
    running: Arc<AtomicBool>,
    sync: Arc<Rendezvous>,
}

impl Manager {
    /// Construct the subsystems. Binds the gadget and opens the HID
    /// endpoints up front so the capture-device wakeup can be delivered.
    pub fn new(
        config: &Config,
        screenshot: Arc<ScreenshotState>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let input = Arc::new(Input::new(
            config.keyboard_path.clone(),
            config.pointer_path.clone(),
            config.udc_name.clone(),
        ));
        input.connect()?;

        let video = Arc::new(Video::new(
            config.video_path.clone(),
            &input,
            config.frame_rate,
            config.subsampling,
            config.pixel_format == 1,
        )?);

        let server = Arc::new(Server::new(
            config.port,
            input.clone(),
            video.clone(),
            config.calc_frame_crc,
        )?);

        Ok(Self {
            input,
            video,
            server,
            screenshot,
            running,
            sync: Arc::new(Rendezvous::new()),
        })
    }

    /// Run both loops until the running flag clears, then disconnect.
    pub fn run(&self) {
        let server_thread = {
            let server = self.server.clone();
            let sync = self.sync.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    server.run();
                    sync.set_server_done();
                    sync.wait_video();
                }
                sync.set_server_done();
            })
        };

        let status_thread = {
            let server = self.server.clone();
            let video = self.video.clone();
            let screenshot = self.screenshot.clone();
            let sync = self.sync.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = Self::status_iteration(&server, &video, &screenshot, &sync) {
                        error!("capture loop failed: {e}");
                        running.store(false, Ordering::SeqCst);
                    }
                }
                sync.set_video_done();
            })
        };

        server_thread.join().ok();
        status_thread.join().ok();

        self.input.disconnect();
        info!("manager stopped");
    }

    /// One pass of the status loop: feed frames while wanted, service
    /// screenshot requests, and run the resize barrier.
    fn status_iteration(
        server: &Server,
        video: &Video,
        screenshot: &ScreenshotState,
        sync: &Rendezvous,
    ) -> Result<()> {
        if server.wants_frame() || screenshot.pending() {
            video.start()?;
            video.get_frame()?;

            if server.wants_frame() {
                server.send_frame();
            }
            if screenshot.pending() {
                video.write_file(&screenshot.path())?;
                screenshot.clear();
            }
        } else {
            video.stop()?;
        }

        if video.needs_resize()? {
            // park the capture side, wait for the server thread to go
            // idle, then reconfigure both under the barrier
            sync.clear_video_done();
            sync.wait_server();
            let resized = video.resize();
            server.resize();
            sync.set_video_done();
            resized
        } else {
            sync.set_video_done();
            sync.wait_server();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sanitize_frame_rate() {
        assert_eq!(sanitize_frame_rate(30), 30);
        assert_eq!(sanitize_frame_rate(1), 1);
        assert_eq!(sanitize_frame_rate(60), 60);
        assert_eq!(sanitize_frame_rate(0), 30);
        assert_eq!(sanitize_frame_rate(-5), 30);
        assert_eq!(sanitize_frame_rate(61), 30);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.port, 5900);
        assert_eq!(config.keyboard_path, PathBuf::from("/dev/hidg0"));
        assert_eq!(config.pointer_path, PathBuf::from("/dev/hidg1"));
        assert!(!config.calc_frame_crc);
    }

    #[test]
    fn test_rendezvous_paces_status_thread() {
        let sync = Arc::new(Rendezvous::new());
        let sync2 = sync.clone();

        // status side: waits until the "server" finishes a pump
        let waiter = thread::spawn(move || {
            sync2.set_video_done();
            sync2.wait_server();
        });

        thread::sleep(Duration::from_millis(20));
        sync.set_server_done();
        waiter.join().unwrap();

        // the consumed server_done flag means a second wait would block
        assert!(!sync.state.lock().unwrap().server_done);
    }

    #[test]
    fn test_rendezvous_video_done_is_level_triggered() {
        let sync = Rendezvous::new();
        // starts true and survives a wait
        sync.wait_video();
        sync.wait_video();
        assert!(sync.state.lock().unwrap().video_done);
    }

    #[test]
    fn test_rendezvous_resize_barrier() {
        let sync = Arc::new(Rendezvous::new());
        let resizing = Arc::new(AtomicBool::new(false));

        let status = {
            let sync = sync.clone();
            let resizing = resizing.clone();
            thread::spawn(move || {
                sync.clear_video_done();
                sync.wait_server();
                resizing.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                resizing.store(false, Ordering::SeqCst);
                sync.set_video_done();
            })
        };

        // server thread finishes its pump, then parks on video_done;
        // it must not observe the resize in progress once released
        thread::sleep(Duration::from_millis(10));
        sync.set_server_done();
        sync.wait_video();
        assert!(!resizing.load(Ordering::SeqCst));

        status.join().unwrap();
    }
}
