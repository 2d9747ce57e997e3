// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! RFB server logic
//!
//! Drives the embedded protocol layer, keeps per-client update state,
//! and emits full-frame updates in the shape the capture stream arrives
//! in: raw copies for RGB24/RGB565, Tight-JPEG pass-through, or chunked
//! pre-compressed hextile. Every update covers the whole frame; client
//! rectangle requests are ignored by policy.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use crate::input::Input;
use crate::rfb::{self, Cursor, EventHandler, PixelFormat, Screen};
use crate::video::{CaptureFormat, Video};
use crate::Result;

/// JFIF headers carry fields that vary per frame (timestamps, restart
/// markers), so checksums skip this prefix.
const CRC_HEADER_SKIP: usize = 0x30;

const DESKTOP_NAME: &str = "OpenBMC IKVM";

/// Per-client update state, stored in the protocol layer's client-data
/// slot. All fields are shared between the pump and capture threads.
pub struct ClientData {
    /// Frames still to be dropped before this client gets updates
    /// (grace period after connect and resize).
    pub skip_frame: AtomicU32,
    /// Checksum of the last frame sent; `u64::MAX` means none yet.
    pub last_crc: AtomicU64,
    /// Set by an explicit update request, cleared when a frame is sent.
    pub needs_update: AtomicBool,
}

impl Default for ClientData {
    fn default() -> Self {
        Self {
            skip_frame: AtomicU32::new(0),
            last_crc: AtomicU64::new(u64::MAX),
            needs_update: AtomicBool::new(false),
        }
    }
}

/// Manages the RFB screen and frame distribution.
pub struct Server {
    screen: Screen<ClientData>,
    input: Arc<Input>,
    video: Arc<Video>,
    frame_rate: u32,
    process_time: Duration,
    calc_frame_crc: bool,
    frame_counter: AtomicU32,
    pending_resize: AtomicBool,
    num_clients: AtomicUsize,
}

impl Server {
    pub fn new(
        port: u16,
        input: Arc<Input>,
        video: Arc<Video>,
        calc_frame_crc: bool,
    ) -> Result<Self> {
        let frame_rate = video.frame_rate();
        let screen = Screen::new(
            port,
            DESKTOP_NAME,
            video.width(),
            video.height(),
            pixel_format_for(video.format()),
            Cursor::pointer_arrow(),
        )?;

        // pump budget: one frame period minus a scheduling margin
        let process_time =
            Duration::from_micros((1_000_000 / frame_rate as u64).saturating_sub(100));

        Ok(Self {
            screen,
            input,
            video,
            frame_rate,
            process_time,
            calc_frame_crc,
            frame_counter: AtomicU32::new(0),
            pending_resize: AtomicBool::new(false),
            num_clients: AtomicUsize::new(0),
        })
    }

    /// One pump tick: process protocol events for the frame budget, then
    /// execute a debounced resize once the signal has been stable for a
    /// full second of frames.
    pub fn run(&self) {
        self.screen.process_events(self.process_time, self);

        if self.screen.client_count() > 0 {
            let count = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
            if self.pending_resize.load(Ordering::Relaxed) && count > self.frame_rate {
                self.do_resize();
                self.pending_resize.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Whether any client is connected (capture can idle otherwise).
    pub fn wants_frame(&self) -> bool {
        self.screen.client_count() > 0
    }

    /// Distribute the current frame to every eligible client.
    pub fn send_frame(&self) {
        if self.pending_resize.load(Ordering::Relaxed) {
            return;
        }
        // geometry first: the frame guard below holds the capture lock
        let width = self.video.width() as u16;
        let height = self.video.height() as u16;
        let format = self.video.format();
        let Some(frame) = self.video.data() else {
            return;
        };
        if frame.is_empty() {
            return;
        }

        let mut frame_crc: Option<u32> = None;
        let mut raw_copied = false;

        for client in self.screen.clients() {
            if client.is_dead() {
                continue;
            }
            let data = &client.data;

            let skip = data.skip_frame.load(Ordering::Relaxed);
            if skip > 0 {
                data.skip_frame.store(skip - 1, Ordering::Relaxed);
                continue;
            }
            if !data.needs_update.load(Ordering::Relaxed) {
                continue;
            }

            if self.calc_frame_crc {
                let crc = *frame_crc.get_or_insert_with(|| {
                    let skip = CRC_HEADER_SKIP.min(frame.len());
                    frame_crc32(&frame[skip..])
                });
                if data.last_crc.load(Ordering::Relaxed) == crc as u64 {
                    continue;
                }
                data.last_crc.store(crc as u64, Ordering::Relaxed);
            }

            data.needs_update.store(false, Ordering::Relaxed);

            let sent = match format {
                CaptureFormat::Rgb24 | CaptureFormat::Rgb565 => {
                    // the protocol layer wire-encodes raw rectangles from
                    // the shared framebuffer during its next pump
                    if !raw_copied {
                        self.screen.copy_to_framebuffer(&frame);
                        self.screen.mark_modified();
                        raw_copied = true;
                    }
                    Ok(())
                }
                CaptureFormat::Jpeg => send_jpeg_frame(&client, width, height, &frame),
                CaptureFormat::Hextile => send_hextile_frame(&client, &frame),
            };

            if let Err(e) = sent {
                debug!("frame to {} failed: {e}", client.peer());
            }
        }
    }

    /// Resize now if the signal has been stable long enough, otherwise
    /// leave it pending for [`Server::run`] to pick up. Debounces the
    /// resolution flapping that follows host mode switches.
    pub fn resize(&self) {
        if self.frame_counter.load(Ordering::Relaxed) > self.frame_rate {
            self.do_resize();
        } else {
            self.pending_resize.store(true, Ordering::Relaxed);
        }
    }

    fn do_resize(&self) {
        let width = self.video.width();
        let height = self.video.height();
        info!("resizing framebuffer to {width}x{height}");

        self.screen.set_framebuffer(width, height);
        self.screen.set_pixel_format(pixel_format_for(self.video.format()));
        self.screen.mark_modified();

        // one second of grace so viewers can re-lay out their windows
        for client in self.screen.clients() {
            client.data.skip_frame.store(self.frame_rate, Ordering::Relaxed);
        }
    }
}

impl EventHandler<ClientData> for Server {
    fn client_joined(&self, client: &Arc<rfb::Client<ClientData>>) {
        client.data.skip_frame.store(self.frame_rate, Ordering::Relaxed);
        if self.num_clients.fetch_add(1, Ordering::Relaxed) == 0 {
            if let Err(e) = self.input.connect() {
                error!("failed to connect HID gadget: {e}");
            }
            self.pending_resize.store(false, Ordering::Relaxed);
            self.frame_counter.store(0, Ordering::Relaxed);
        }
    }

    fn client_left(&self, _client: &Arc<rfb::Client<ClientData>>) {
        if self.num_clients.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.input.disconnect();
            // don't let the next client inherit a half-finished update
            self.screen.mark_modified();
        }
    }

    fn key_event(&self, down: bool, keysym: u32, _client: &Arc<rfb::Client<ClientData>>) {
        self.input.key_event(down, keysym);
    }

    fn pointer_event(
        &self,
        button_mask: u8,
        x: u16,
        y: u16,
        _client: &Arc<rfb::Client<ClientData>>,
    ) {
        self.input
            .pointer_event(button_mask, x, y, self.video.width(), self.video.height());
    }

    fn update_requested(&self, client: &Arc<rfb::Client<ClientData>>) {
        client.data.needs_update.store(true, Ordering::Relaxed);
    }
}

/// JPEG frames travel as a single Tight rect with the JPEG subencoding;
/// the device output is forwarded byte-for-byte.
fn send_jpeg_frame(
    client: &Arc<rfb::Client<ClientData>>,
    width: u16,
    height: u16,
    frame: &[u8],
) -> std::io::Result<()> {
    let last_rect = client.enables_last_rect();
    let n_rects = if last_rect { rfb::LAST_RECT_COUNT } else { 1 };
    let mut writer = client.writer();
    writer.send_update_header(n_rects)?;
    writer.send_tight_header(0, 0, width, height)?;
    writer.send_tight_jpeg_data(frame)?;
    if last_rect {
        writer.send_last_rect_marker()?;
    }
    writer.flush()
}

/// The hextile stream already carries its own rectangle framing; it is
/// chunked through the update buffer unmodified.
fn send_hextile_frame(
    client: &Arc<rfb::Client<ClientData>>,
    frame: &[u8],
) -> std::io::Result<()> {
    let last_rect = client.enables_last_rect();
    let n_rects = if last_rect { rfb::LAST_RECT_COUNT } else { 1 };
    let mut writer = client.writer();
    writer.send_update_header(n_rects)?;
    writer.send_hextile_data(frame)?;
    if last_rect {
        writer.send_last_rect_marker()?;
    }
    writer.flush()
}

fn pixel_format_for(format: CaptureFormat) -> PixelFormat {
    match format {
        CaptureFormat::Rgb565 | CaptureFormat::Hextile => PixelFormat::rgb565(),
        CaptureFormat::Rgb24 | CaptureFormat::Jpeg => PixelFormat::rgb888(),
    }
}

/// Reflected CRC-32 over polynomial 0x04C11DB7 with full pre/post
/// inversion, matching the dedup checksums of other IKVM deployments.
pub fn frame_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(frame_crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn test_crc32_identical_frames_match() {
        let frame = vec![0x5au8; 4096];
        assert_eq!(frame_crc32(&frame), frame_crc32(&frame.clone()));

        let mut other = frame.clone();
        other[4095] ^= 1;
        assert_ne!(frame_crc32(&frame), frame_crc32(&other));
    }

    #[test]
    fn test_pixel_format_by_capture_format() {
        assert_eq!(
            pixel_format_for(CaptureFormat::Rgb565),
            PixelFormat::rgb565()
        );
        assert_eq!(
            pixel_format_for(CaptureFormat::Hextile),
            PixelFormat::rgb565()
        );
        assert_eq!(pixel_format_for(CaptureFormat::Jpeg), PixelFormat::rgb888());
        assert_eq!(
            pixel_format_for(CaptureFormat::Rgb24),
            PixelFormat::rgb888()
        );
    }

    #[test]
    fn test_client_data_defaults() {
        let data = ClientData::default();
        assert_eq!(data.skip_frame.load(Ordering::Relaxed), 0);
        assert_eq!(data.last_crc.load(Ordering::Relaxed), u64::MAX);
        assert!(!data.needs_update.load(Ordering::Relaxed));
    }
}
