// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! HID input injection
//!
//! Owns the keyboard and pointer gadget character devices, maintains the
//! in-flight report buffers, and binds/unbinds the gadget to a USB device
//! controller. Report state is tracked even while the devices are closed
//! so a reconnect resumes from a consistent picture of what is held down.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::keymap::{keysym_to_modifier, keysym_to_scancode};
use crate::{Error, Result};

/// Keyboard report: modifiers, reserved, six usage slots.
pub const KEY_REPORT_LENGTH: usize = 8;
/// Pointer report: buttons, X lo/hi, Y lo/hi, wheel.
pub const PTR_REPORT_LENGTH: usize = 6;
/// First usage slot in the keyboard report.
const FIRST_KEY_SLOT: usize = 2;
/// Absolute coordinate space of the mouse descriptor.
const ABS_RANGE: u32 = 32768;

/// Retry limit for writing an HID report.
const HID_REPORT_RETRY_MAX: u32 = 5;
const HID_REPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// UDC attribute of the provisioned gadget.
const HID_UDC_PATH: &str = "/sys/kernel/config/usb_gadget/obmc_hid/UDC";
/// USB virtual hub platform device searched when no UDC is configured.
const USB_VHUB_PATH: &str = "/sys/bus/platform/devices/1e6a0000.usb-vhub";

struct KeyboardState {
    dev: Option<File>,
    report: [u8; KEY_REPORT_LENGTH],
    /// keysym -> report slot currently holding its scancode
    keys_down: HashMap<u32, usize>,
    /// per-modifier-bit down counts so a rapid re-press cannot wedge a bit
    mod_counts: [u8; 8],
}

struct PointerState {
    dev: Option<File>,
    report: [u8; PTR_REPORT_LENGTH],
}

/// Receives events from RFB clients and writes reports to the USB gadget.
pub struct Input {
    keyboard_path: PathBuf,
    pointer_path: PathBuf,
    udc_name: Option<String>,
    udc_attr: PathBuf,
    vhub_dir: PathBuf,
    keyboard: Mutex<KeyboardState>,
    pointer: Mutex<PointerState>,
}

impl Input {
    pub fn new(
        keyboard_path: PathBuf,
        pointer_path: PathBuf,
        udc_name: Option<String>,
    ) -> Self {
        Self {
            keyboard_path,
            pointer_path,
            udc_name,
            udc_attr: PathBuf::from(HID_UDC_PATH),
            vhub_dir: PathBuf::from(USB_VHUB_PATH),
            keyboard: Mutex::new(KeyboardState {
                dev: None,
                report: [0; KEY_REPORT_LENGTH],
                keys_down: HashMap::new(),
                mod_counts: [0; 8],
            }),
            pointer: Mutex::new(PointerState {
                dev: None,
                report: [0; PTR_REPORT_LENGTH],
            }),
        }
    }

    /// Bind the gadget to a UDC (if not already bound) and open both HID
    /// character devices. Failure to open a device is fatal.
    pub fn connect(&self) -> Result<()> {
        let bound = fs::read_to_string(&self.udc_attr)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !bound {
            let port = match &self.udc_name {
                Some(name) => name.clone(),
                None => find_vhub_port(&self.vhub_dir).ok_or_else(|| {
                    Error::Config("no available port on the USB virtual hub".into())
                })?,
            };
            fs::write(&self.udc_attr, &port).map_err(|source| Error::Gadget {
                path: self.udc_attr.clone(),
                source,
            })?;
            info!("bound HID gadget to UDC {port}");
        }

        let mut kbd = self.keyboard.lock().expect("Failed to lock keyboard mutex: another thread panicked while holding the lock");
        if kbd.dev.is_none() {
            kbd.dev = Some(open_hid_device(&self.keyboard_path)?);
            debug!("opened keyboard device {}", self.keyboard_path.display());
        }
        drop(kbd);

        let mut ptr = self.pointer.lock().expect("Failed to lock pointer mutex: another thread panicked while holding the lock");
        if ptr.dev.is_none() {
            ptr.dev = Some(open_hid_device(&self.pointer_path)?);
            debug!("opened pointer device {}", self.pointer_path.display());
        }
        Ok(())
    }

    /// Close the character devices and unbind the gadget from its UDC.
    pub fn disconnect(&self) {
        self.keyboard.lock().expect("Failed to lock keyboard mutex: another thread panicked while holding the lock").dev = None;
        self.pointer.lock().expect("Failed to lock pointer mutex: another thread panicked while holding the lock").dev = None;
        if let Err(e) = fs::write(&self.udc_attr, "") {
            warn!("failed to unbind UDC via {}: {e}", self.udc_attr.display());
        } else {
            info!("unbound HID gadget from UDC");
        }
    }

    /// Apply an RFB key event to the keyboard report and send it.
    pub fn key_event(&self, down: bool, key: u32) {
        let report = {
            let mut kbd = self.keyboard.lock().expect("Failed to lock keyboard mutex: another thread panicked while holding the lock");
            let mut send = false;

            if down {
                let scancode = keysym_to_scancode(key);
                if scancode != 0 {
                    if !kbd.keys_down.contains_key(&key) {
                        let slot = (FIRST_KEY_SLOT..KEY_REPORT_LENGTH)
                            .find(|&i| kbd.report[i] == 0);
                        if let Some(slot) = slot {
                            kbd.report[slot] = scancode;
                            kbd.keys_down.insert(key, slot);
                            send = true;
                        }
                        // no free slot: a seventh concurrent key is dropped
                    }
                } else {
                    let modifier = keysym_to_modifier(key);
                    if modifier != 0 {
                        kbd.press_modifier(modifier);
                        send = true;
                    }
                }
            } else if let Some(slot) = kbd.keys_down.remove(&key) {
                kbd.report[slot] = 0;
                send = true;
            } else {
                let modifier = keysym_to_modifier(key);
                if modifier != 0 {
                    kbd.release_modifier(modifier);
                    send = true;
                }
            }

            if !send {
                return;
            }
            kbd.report
        };

        self.write_keyboard(&report);
    }

    /// Apply an RFB pointer event to the pointer report and send it.
    ///
    /// `width`/`height` are the current framebuffer dimensions used to
    /// scale into the absolute coordinate space.
    pub fn pointer_event(&self, button_mask: u8, x: u16, y: u16, width: u32, height: u32) {
        let report = {
            let mut ptr = self.pointer.lock().expect("Failed to lock pointer mutex: another thread panicked while holding the lock");

            match button_mask {
                8 => {
                    ptr.report[0] = 0;
                    ptr.report[5] = 0x01; // wheel up
                }
                16 => {
                    ptr.report[0] = 0;
                    ptr.report[5] = 0xff; // wheel down
                }
                mask => {
                    // RFB {left=1, middle=2, right=4} -> HID {left, right, middle}
                    let mask = mask & 0x07;
                    ptr.report[0] = ((mask & 4) >> 1) | ((mask & 2) << 1) | (mask & 1);
                    ptr.report[5] = 0;
                }
            }

            if width > 0 && (x as u32) < width {
                let xx = (x as u32 * ABS_RANGE / width) as u16;
                ptr.report[1..3].copy_from_slice(&xx.to_le_bytes());
            }
            if height > 0 && (y as u32) < height {
                let yy = (y as u32 * ABS_RANGE / height) as u16;
                ptr.report[3..5].copy_from_slice(&yy.to_le_bytes());
            }

            ptr.report
        };

        self.write_pointer(&report);
    }

    /// Nudge the host out of USB suspend: a centered pointer report
    /// followed by a shift press/release pair.
    pub fn send_wakeup_packet(&self) {
        let center = (ABS_RANGE / 2) as u16;
        let mut pointer = [0u8; PTR_REPORT_LENGTH];
        pointer[1..3].copy_from_slice(&center.to_le_bytes());
        pointer[3..5].copy_from_slice(&center.to_le_bytes());
        self.write_pointer(&pointer);

        let mut keyboard = [0u8; KEY_REPORT_LENGTH];
        keyboard[0] = 0x02; // left shift
        self.write_keyboard(&keyboard);
        keyboard[0] = 0;
        self.write_keyboard(&keyboard);
    }

    /// Current keyboard report bytes (for observation and tests).
    pub fn keyboard_report(&self) -> [u8; KEY_REPORT_LENGTH] {
        self.keyboard.lock().expect("Failed to lock keyboard mutex: another thread panicked while holding the lock").report
    }

    /// Current pointer report bytes (for observation and tests).
    pub fn pointer_report(&self) -> [u8; PTR_REPORT_LENGTH] {
        self.pointer.lock().expect("Failed to lock pointer mutex: another thread panicked while holding the lock").report
    }

    fn write_keyboard(&self, report: &[u8; KEY_REPORT_LENGTH]) {
        for _ in 0..HID_REPORT_RETRY_MAX {
            let mut kbd = self.keyboard.lock().expect("Failed to lock keyboard mutex: another thread panicked while holding the lock");
            let Some(dev) = kbd.dev.as_mut() else { return };
            match dev.write(report) {
                Ok(_) => return,
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    drop(kbd);
                    thread::sleep(HID_REPORT_RETRY_DELAY);
                }
                Err(e) if e.raw_os_error() == Some(libc::ESHUTDOWN) => return,
                Err(e) => {
                    error!("failed to write keyboard report: {e}");
                    return;
                }
            }
        }
        warn!("keyboard report dropped after {HID_REPORT_RETRY_MAX} retries");
    }

    fn write_pointer(&self, report: &[u8; PTR_REPORT_LENGTH]) {
        for _ in 0..HID_REPORT_RETRY_MAX {
            let mut ptr = self.pointer.lock().expect("Failed to lock pointer mutex: another thread panicked while holding the lock");
            let Some(dev) = ptr.dev.as_mut() else { return };
            match dev.write(report) {
                Ok(_) => return,
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    drop(ptr);
                    thread::sleep(HID_REPORT_RETRY_DELAY);
                }
                Err(e) if e.raw_os_error() == Some(libc::ESHUTDOWN) => return,
                Err(e) => {
                    error!("failed to write pointer report: {e}");
                    return;
                }
            }
        }
        warn!("pointer report dropped after {HID_REPORT_RETRY_MAX} retries");
    }
}

impl KeyboardState {
    fn press_modifier(&mut self, bit: u8) {
        let idx = bit.trailing_zeros() as usize;
        self.mod_counts[idx] = self.mod_counts[idx].saturating_add(1);
        self.report[0] |= bit;
    }

    fn release_modifier(&mut self, bit: u8) {
        let idx = bit.trailing_zeros() as usize;
        self.mod_counts[idx] = self.mod_counts[idx].saturating_sub(1);
        if self.mod_counts[idx] == 0 {
            self.report[0] &= !bit;
        }
    }
}

fn open_hid_device(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| Error::Device {
            path: path.to_path_buf(),
            source,
        })
}

/// Find the first virtual-hub port whose `gadget*` subdirectory lacks a
/// `suspended` attribute, i.e. a port not parked by the host.
pub fn find_vhub_port(vhub_dir: &Path) -> Option<String> {
    let entries = fs::read_dir(vhub_dir).ok()?;
    let mut ports: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    ports.sort();

    for port in ports {
        let name = port.file_name()?.to_str()?.to_string();
        if !name.contains(":p") {
            continue;
        }
        let subdirs = match fs::read_dir(&port) {
            Ok(subdirs) => subdirs,
            Err(_) => continue,
        };
        for sub in subdirs.flatten() {
            let is_gadget = sub
                .file_name()
                .to_str()
                .map(|n| n.starts_with("gadget"))
                .unwrap_or(false);
            if is_gadget && !sub.path().join("suspended").exists() {
                return Some(name);
            }
        }
    }
    None
}
