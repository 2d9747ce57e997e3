// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! V4L2 capture pipeline
//!
//! Owns the capture device and its memory-mapped streaming buffers,
//! hands the most recent frame to the server, and detects resolution
//! changes by querying DV timings. Exactly one producer thread calls
//! [`Video::get_frame`]/[`Video::resize`]; readers take the frame through
//! the guard returned by [`Video::data`].

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;

use crate::input::Input;
use crate::v4l2::{self, BufferFlags};
use crate::{Error, Result};

/// Streaming buffer slots requested from the driver.
const NUM_BUFFERS: u32 = 3;
/// Grace period before the post-wakeup open retry.
const WAKEUP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Pixel format reported by the capture device; drives the server's
/// per-frame encoding strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    Rgb24,
    Rgb565,
    Jpeg,
    Hextile,
}

impl CaptureFormat {
    pub fn from_fourcc(fourcc: u32) -> Option<Self> {
        match fourcc {
            v4l2::PIX_FMT_RGB24 => Some(CaptureFormat::Rgb24),
            v4l2::PIX_FMT_RGB565 => Some(CaptureFormat::Rgb565),
            v4l2::PIX_FMT_JPEG => Some(CaptureFormat::Jpeg),
            v4l2::PIX_FMT_HEXTILE => Some(CaptureFormat::Hextile),
            _ => None,
        }
    }

    /// Raw formats are copied into the shared framebuffer; compressed
    /// formats are passed through to the client verbatim.
    pub fn is_raw(self) -> bool {
        matches!(self, CaptureFormat::Rgb24 | CaptureFormat::Rgb565)
    }
}

/// One mapped streaming slot.
struct FrameSlot {
    map: MmapMut,
    /// Byte length of the most recent dequeue into this slot.
    payload: usize,
    /// Whether the slot is currently queued to the kernel.
    queued: bool,
}

struct CaptureState {
    format: CaptureFormat,
    width: u32,
    height: u32,
    streaming: bool,
    /// Slot holding the newest complete frame, if any.
    last: Option<usize>,
    buffers: Vec<FrameSlot>,
}

/// The capture device and its buffer table.
pub struct Video {
    path: PathBuf,
    dev: File,
    frame_rate: u32,
    state: Mutex<CaptureState>,
}

impl Video {
    /// Open and configure the capture device, map the streaming buffers.
    ///
    /// Some host firmwares park the capture block until an HID event
    /// arrives, so a failed open is retried once after a wakeup packet.
    pub fn new(
        path: PathBuf,
        input: &Input,
        frame_rate: u32,
        subsampling: u32,
        request_hextile: bool,
    ) -> Result<Self> {
        let dev = match open_device(&path) {
            Ok(dev) => dev,
            Err(e) => {
                warn!(
                    "failed to open {} ({e}), sending wakeup packet and retrying",
                    path.display()
                );
                input.send_wakeup_packet();
                thread::sleep(WAKEUP_RETRY_DELAY);
                open_device(&path).map_err(|source| Error::Device {
                    path: path.clone(),
                    source,
                })?
            }
        };

        let video = Self {
            path,
            dev,
            frame_rate,
            state: Mutex::new(CaptureState {
                format: CaptureFormat::Jpeg,
                width: 0,
                height: 0,
                streaming: false,
                last: None,
                buffers: Vec::new(),
            }),
        };

        video.check_capabilities()?;
        video.set_subsampling(subsampling);
        video.set_frame_rate();
        if request_hextile {
            video.request_format(v4l2::PIX_FMT_HEXTILE)?;
        }

        let mut state = video.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        video.resize_locked(&mut state)?;
        info!(
            "capture device {} ready: {}x{} {:?}",
            video.path.display(),
            state.width,
            state.height,
            state.format
        );
        drop(state);

        Ok(video)
    }

    fn check_capabilities(&self) -> Result<()> {
        let mut cap = v4l2::Capability::zeroed();
        unsafe { v4l2::vidioc_querycap(self.fd(), &mut cap) }
            .map_err(|e| ioctl_err("VIDIOC_QUERYCAP", e))?;

        let caps = if cap.device_caps != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & v4l2::CAP_VIDEO_CAPTURE == 0 || caps & v4l2::CAP_STREAMING == 0 {
            return Err(Error::Config(format!(
                "{} does not support streaming video capture",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn set_subsampling(&self, subsampling: u32) {
        let mut ctrl = v4l2::Control::zeroed();
        ctrl.id = v4l2::CID_JPEG_CHROMA_SUBSAMPLING;
        ctrl.value = if subsampling == 1 {
            v4l2::JPEG_CHROMA_SUBSAMPLING_420
        } else {
            v4l2::JPEG_CHROMA_SUBSAMPLING_444
        };
        if let Err(e) = unsafe { v4l2::vidioc_s_ctrl(self.fd(), &mut ctrl) } {
            debug!("driver rejected chroma subsampling control: {e}");
        }
    }

    fn set_frame_rate(&self) {
        let mut parm = v4l2::StreamParm::zeroed();
        parm.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
        parm.capture.timeperframe.numerator = 1;
        parm.capture.timeperframe.denominator = self.frame_rate;
        if let Err(e) = unsafe { v4l2::vidioc_s_parm(self.fd(), &mut parm) } {
            debug!("driver rejected frame rate {}: {e}", self.frame_rate);
        }
    }

    fn request_format(&self, fourcc: u32) -> Result<()> {
        let mut fmt = v4l2::Format::zeroed();
        fmt.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
        unsafe { v4l2::vidioc_g_fmt(self.fd(), &mut fmt) }
            .map_err(|e| ioctl_err("VIDIOC_G_FMT", e))?;
        fmt.pix.pixelformat = fourcc;
        unsafe { v4l2::vidioc_s_fmt(self.fd(), &mut fmt) }
            .map_err(|e| ioctl_err("VIDIOC_S_FMT", e))?;
        Ok(())
    }

    /// Enable streaming. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        if state.streaming {
            return Ok(());
        }
        self.stream_on()?;
        state.streaming = true;
        Ok(())
    }

    /// Disable streaming. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        if !state.streaming {
            return Ok(());
        }
        self.stream_off()?;
        state.streaming = false;
        Ok(())
    }

    /// Dequeue until a clean frame arrives, then requeue every other slot.
    pub fn get_frame(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        if !state.streaming || state.buffers.is_empty() {
            return Ok(());
        }

        loop {
            let mut buf = v4l2::Buffer::zeroed();
            buf.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = v4l2::MEMORY_MMAP;
            match unsafe { v4l2::vidioc_dqbuf(self.fd(), &mut buf) } {
                Ok(_) => {
                    let index = buf.index as usize;
                    if index >= state.buffers.len() {
                        continue;
                    }
                    state.buffers[index].queued = false;
                    let flags = BufferFlags::from_bits_truncate(buf.flags);
                    if flags.contains(BufferFlags::ERROR) {
                        // bad capture, skip and keep draining
                        state.buffers[index].payload = 0;
                        continue;
                    }
                    let len = (buf.bytesused as usize).min(state.buffers[index].map.len());
                    state.buffers[index].payload = len;
                    state.last = Some(index);
                    break;
                }
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    debug!("VIDIOC_DQBUF failed: {e}");
                    break;
                }
            }
        }

        let last = state.last;
        for index in 0..state.buffers.len() {
            if Some(index) == last || state.buffers[index].queued {
                continue;
            }
            let mut buf = v4l2::Buffer::zeroed();
            buf.index = index as u32;
            buf.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = v4l2::MEMORY_MMAP;
            unsafe { v4l2::vidioc_qbuf(self.fd(), &mut buf) }
                .map_err(|e| ioctl_err("VIDIOC_QBUF", e))?;
            state.buffers[index].queued = true;
        }
        Ok(())
    }

    /// Query DV timings and report whether the active signal dimensions
    /// changed. Updates the cached dimensions and invalidates the last
    /// frame on change. Zero dimensions are fatal.
    pub fn needs_resize(&self) -> Result<bool> {
        let mut timings = v4l2::DvTimings::zeroed();
        unsafe { v4l2::vidioc_query_dv_timings(self.fd(), &mut timings) }
            .map_err(|e| ioctl_err("VIDIOC_QUERY_DV_TIMINGS", e))?;

        let width = { timings.bt.width };
        let height = { timings.bt.height };
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "{} reported a {width}x{height} video signal",
                self.path.display()
            )));
        }

        let mut state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        if width != state.width || height != state.height {
            debug!(
                "video signal changed {}x{} -> {width}x{height}",
                state.width, state.height
            );
            state.width = width;
            state.height = height;
            state.last = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Tear down and rebuild the streaming buffers for the current video
    /// signal. Streaming is restarted if it had been active.
    pub fn resize(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        self.resize_locked(&mut state)
    }

    fn resize_locked(&self, state: &mut MutexGuard<'_, CaptureState>) -> Result<()> {
        let was_streaming = state.streaming;
        if was_streaming {
            self.stream_off()?;
            state.streaming = false;
        }

        // unmap before releasing the driver-side buffers
        state.buffers.clear();
        state.last = None;
        let mut req = v4l2::RequestBuffers::zeroed();
        req.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
        req.memory = v4l2::MEMORY_MMAP;
        unsafe { v4l2::vidioc_reqbufs(self.fd(), &mut req) }
            .map_err(|e| ioctl_err("VIDIOC_REQBUFS", e))?;

        let mut timings = v4l2::DvTimings::zeroed();
        unsafe { v4l2::vidioc_query_dv_timings(self.fd(), &mut timings) }
            .map_err(|e| ioctl_err("VIDIOC_QUERY_DV_TIMINGS", e))?;
        unsafe { v4l2::vidioc_s_dv_timings(self.fd(), &mut timings) }
            .map_err(|e| ioctl_err("VIDIOC_S_DV_TIMINGS", e))?;

        let mut fmt = v4l2::Format::zeroed();
        fmt.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
        unsafe { v4l2::vidioc_g_fmt(self.fd(), &mut fmt) }
            .map_err(|e| ioctl_err("VIDIOC_G_FMT", e))?;
        state.width = fmt.pix.width;
        state.height = fmt.pix.height;
        state.format = CaptureFormat::from_fourcc(fmt.pix.pixelformat).ok_or_else(|| {
            Error::Config(format!(
                "{} reports unsupported pixel format {:#010x}",
                self.path.display(),
                fmt.pix.pixelformat
            ))
        })?;

        let mut req = v4l2::RequestBuffers::zeroed();
        req.count = NUM_BUFFERS;
        req.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
        req.memory = v4l2::MEMORY_MMAP;
        unsafe { v4l2::vidioc_reqbufs(self.fd(), &mut req) }
            .map_err(|e| ioctl_err("VIDIOC_REQBUFS", e))?;

        for index in 0..req.count {
            let mut buf = v4l2::Buffer::zeroed();
            buf.index = index;
            buf.typ = v4l2::BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = v4l2::MEMORY_MMAP;
            unsafe { v4l2::vidioc_querybuf(self.fd(), &mut buf) }
                .map_err(|e| ioctl_err("VIDIOC_QUERYBUF", e))?;

            // SAFETY: offset/length come from QUERYBUF for this device.
            let map = unsafe {
                MmapOptions::new()
                    .offset(buf.m_offset as u64)
                    .len(buf.length as usize)
                    .map_mut(&self.dev)
            }
            .map_err(|source| Error::Device {
                path: self.path.clone(),
                source,
            })?;

            unsafe { v4l2::vidioc_qbuf(self.fd(), &mut buf) }
                .map_err(|e| ioctl_err("VIDIOC_QBUF", e))?;
            state.buffers.push(FrameSlot {
                map,
                payload: 0,
                queued: true,
            });
        }

        if was_streaming {
            self.stream_on()?;
            state.streaming = true;
        }
        debug!(
            "mapped {} capture buffers for {}x{}",
            state.buffers.len(),
            state.width,
            state.height
        );
        Ok(())
    }

    /// Bytes of the last-dequeued frame, if one exists.
    pub fn data(&self) -> Option<FrameData<'_>> {
        let state = self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock");
        state.last?;
        Some(FrameData { state })
    }

    /// Dump the current frame to a file (screenshot RPC path).
    pub fn write_file(&self, path: &Path) -> Result<()> {
        match self.data() {
            Some(frame) => std::fs::write(path, &*frame).map_err(|source| Error::Device {
                path: path.to_path_buf(),
                source,
            }),
            None => {
                warn!("no frame available for screenshot");
                Ok(())
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock").width
    }

    pub fn height(&self) -> u32 {
        self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock").height
    }

    pub fn format(&self) -> CaptureFormat {
        self.state.lock().expect("Failed to lock capture state mutex: another thread panicked while holding the lock").format
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn fd(&self) -> i32 {
        self.dev.as_raw_fd()
    }

    fn stream_on(&self) -> Result<()> {
        let typ = v4l2::BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        unsafe { v4l2::vidioc_streamon(self.fd(), &typ) }
            .map_err(|e| ioctl_err("VIDIOC_STREAMON", e))?;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let typ = v4l2::BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        unsafe { v4l2::vidioc_streamoff(self.fd(), &typ) }
            .map_err(|e| ioctl_err("VIDIOC_STREAMOFF", e))?;
        Ok(())
    }
}

/// Read access to the newest frame, held for the duration of the borrow.
pub struct FrameData<'a> {
    state: MutexGuard<'a, CaptureState>,
}

impl Deref for FrameData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let index = self.state.last.expect("FrameData implies a frame");
        let slot = &self.state.buffers[index];
        &slot.map[..slot.payload]
    }
}

fn open_device(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn ioctl_err(op: &'static str, errno: Errno) -> Error {
    Error::Ioctl {
        op,
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_format_from_fourcc() {
        assert_eq!(
            CaptureFormat::from_fourcc(v4l2::PIX_FMT_RGB24),
            Some(CaptureFormat::Rgb24)
        );
        assert_eq!(
            CaptureFormat::from_fourcc(v4l2::PIX_FMT_RGB565),
            Some(CaptureFormat::Rgb565)
        );
        assert_eq!(
            CaptureFormat::from_fourcc(v4l2::PIX_FMT_JPEG),
            Some(CaptureFormat::Jpeg)
        );
        assert_eq!(
            CaptureFormat::from_fourcc(v4l2::PIX_FMT_HEXTILE),
            Some(CaptureFormat::Hextile)
        );
        assert_eq!(CaptureFormat::from_fourcc(0xdead_beef), None);
    }

    #[test]
    fn test_raw_formats() {
        assert!(CaptureFormat::Rgb24.is_raw());
        assert!(CaptureFormat::Rgb565.is_raw());
        assert!(!CaptureFormat::Jpeg.is_raw());
        assert!(!CaptureFormat::Hextile.is_raw());
    }

    #[test]
    fn test_buffer_pool_size() {
        // the dequeue/requeue pass needs at least one spare slot
        assert!(NUM_BUFFERS >= 2);
    }
}
