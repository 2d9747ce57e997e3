// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! USB HID gadget provisioning
//!
//! Builds the composite keyboard + absolute-mouse gadget in the kernel's
//! configfs tree and selects a free USB device controller. Attribute
//! write order matters: function descriptors must exist before the config
//! symlinks, and the `UDC` attribute is written last by [`crate::Input`]
//! because a non-empty UDC name binds the gadget and freezes its layout.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::{Error, Result};

/// Gadget tree location relative to the sysfs mount point.
pub const GADGET_BASE: &str = "kernel/config/usb_gadget";
/// UDC class directory relative to the sysfs mount point.
const UDC_BASE: &str = "class/udc";

const KEYBOARD_FUNCTION: &str = "hid.0";
const MOUSE_FUNCTION: &str = "hid.1";

/// HID report descriptor for the keyboard function (boot protocol,
/// 8-byte reports: modifiers, reserved, six usage slots).
pub const KEYBOARD_REPORT_DESC: [u8; 63] = [
    0x05, 0x01, // USAGE_PAGE (Generic Desktop)
    0x09, 0x06, // USAGE (Keyboard)
    0xa1, 0x01, // COLLECTION (Application)
    0x05, 0x07, //   USAGE_PAGE (Keyboard)
    0x19, 0xe0, //   USAGE_MINIMUM (Keyboard LeftControl)
    0x29, 0xe7, //   USAGE_MAXIMUM (Keyboard Right GUI)
    0x15, 0x00, //   LOGICAL_MINIMUM (0)
    0x25, 0x01, //   LOGICAL_MAXIMUM (1)
    0x75, 0x01, //   REPORT_SIZE (1)
    0x95, 0x08, //   REPORT_COUNT (8)
    0x81, 0x02, //   INPUT (Data,Var,Abs)
    0x95, 0x01, //   REPORT_COUNT (1)
    0x75, 0x08, //   REPORT_SIZE (8)
    0x81, 0x03, //   INPUT (Data,Var,Abs)
    0x95, 0x05, //   REPORT_COUNT (5)
    0x75, 0x01, //   REPORT_SIZE (1)
    0x05, 0x08, //   USAGE_PAGE (LEDs)
    0x19, 0x01, //   USAGE_MINIMUM (Num Lock)
    0x29, 0x05, //   USAGE_MAXIMUM (Kana)
    0x91, 0x02, //   OUTPUT (Data,Var,Abs)
    0x95, 0x01, //   REPORT_COUNT (1)
    0x75, 0x03, //   REPORT_SIZE (3)
    0x91, 0x03, //   OUTPUT (Cnst,Var,Abs)
    0x95, 0x06, //   REPORT_COUNT (6)
    0x75, 0x08, //   REPORT_SIZE (8)
    0x15, 0x00, //   LOGICAL_MINIMUM (0)
    0x25, 0x65, //   LOGICAL_MAXIMUM (101)
    0x05, 0x07, //   USAGE_PAGE (Keyboard)
    0x19, 0x00, //   USAGE_MINIMUM (Reserved)
    0x29, 0x65, //   USAGE_MAXIMUM (Keyboard Application)
    0x81, 0x00, //   INPUT (Data,Ary,Abs)
    0xc0, //       END_COLLECTION
];

/// HID report descriptor for the absolute-coordinate mouse function
/// (6-byte reports: buttons, X, Y little-endian u16, wheel).
pub const MOUSE_REPORT_DESC: [u8; 76] = [
    0x05, 0x01, //       USAGE_PAGE (Generic Desktop)
    0x09, 0x02, //       USAGE (Mouse)
    0xa1, 0x01, //       COLLECTION (Application)
    0x09, 0x01, //         USAGE (Pointer)
    0xa1, 0x00, //         COLLECTION (Physical)
    0x05, 0x09, //           USAGE_PAGE (Button)
    0x19, 0x01, //           USAGE_MINIMUM (Button 1)
    0x29, 0x03, //           USAGE_MAXIMUM (Button 3)
    0x15, 0x00, //           LOGICAL_MINIMUM (0)
    0x25, 0x01, //           LOGICAL_MAXIMUM (1)
    0x95, 0x03, //           REPORT_COUNT (3)
    0x75, 0x01, //           REPORT_SIZE (1)
    0x81, 0x02, //           INPUT (Data,Var,Abs)
    0x95, 0x01, //           REPORT_COUNT (1)
    0x75, 0x05, //           REPORT_SIZE (5)
    0x81, 0x03, //           INPUT (Cnst,Var,Abs)
    0x05, 0x01, //           USAGE_PAGE (Generic Desktop)
    0x09, 0x30, //           USAGE (X)
    0x09, 0x31, //           USAGE (Y)
    0x35, 0x00, //           PHYSICAL_MINIMUM (0)
    0x46, 0xff, 0x7f, //     PHYSICAL_MAXIMUM (32767)
    0x15, 0x00, //           LOGICAL_MINIMUM (0)
    0x26, 0xff, 0x7f, //     LOGICAL_MAXIMUM (32767)
    0x65, 0x11, //           UNIT (SI Lin:Distance)
    0x55, 0x00, //           UNIT_EXPONENT (0)
    0x75, 0x10, //           REPORT_SIZE (16)
    0x95, 0x02, //           REPORT_COUNT (2)
    0x81, 0x02, //           INPUT (Data,Var,Abs)
    0x09, 0x38, //           USAGE (Wheel)
    0x15, 0xff, //           LOGICAL_MINIMUM (-1)
    0x25, 0x01, //           LOGICAL_MAXIMUM (1)
    0x35, 0x00, //           PHYSICAL_MINIMUM (-127)
    0x45, 0x00, //           PHYSICAL_MAXIMUM (127)
    0x75, 0x08, //           REPORT_SIZE (8)
    0x95, 0x01, //           REPORT_COUNT (1)
    0x81, 0x06, //           INPUT (Data,Var,Rel)
    0xc0, //                END_COLLECTION
    0xc0, //              END_COLLECTION
];

fn keyboard_function_dir(gadget_dir: &Path) -> PathBuf {
    gadget_dir.join("functions").join(KEYBOARD_FUNCTION)
}

fn mouse_function_dir(gadget_dir: &Path) -> PathBuf {
    gadget_dir.join("functions").join(MOUSE_FUNCTION)
}

fn config_dir(gadget_dir: &Path) -> PathBuf {
    gadget_dir.join("configs").join("c.1")
}

fn locale_dir(base: &Path) -> PathBuf {
    base.join("strings").join("0x409")
}

fn write_attribute(dir: &Path, attribute: &str, data: &str) -> Result<()> {
    let path = dir.join(attribute);
    fs::write(&path, format!("{data}\n")).map_err(|source| Error::Gadget { path, source })
}

fn write_raw_attribute(dir: &Path, attribute: &str, data: &[u8]) -> Result<()> {
    let path = dir.join(attribute);
    fs::write(&path, data).map_err(|source| Error::Gadget { path, source })
}

fn create_dirs(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| Error::Gadget {
        path: path.to_path_buf(),
        source,
    })
}

/// Collect the UDC names currently claimed by gadgets under the configfs
/// gadget base. Enumeration problems yield an empty set (best effort).
fn ports_in_use(sysfs_root: &Path) -> Vec<String> {
    let gadget_base = sysfs_root.join(GADGET_BASE);
    let mut in_use = Vec::new();
    let entries = match fs::read_dir(&gadget_base) {
        Ok(entries) => entries,
        Err(_) => return in_use,
    };
    for entry in entries.flatten() {
        let udc_attr = entry.path().join("UDC");
        if let Ok(contents) = fs::read_to_string(&udc_attr) {
            let port = contents.split_whitespace().next().unwrap_or("");
            if !port.is_empty() {
                in_use.push(port.to_string());
            }
        }
    }
    in_use
}

/// Find the first UDC under `class/udc` that no gadget has claimed.
pub fn find_free_udc(sysfs_root: &Path) -> Option<String> {
    let udc_base = sysfs_root.join(UDC_BASE);
    let entries = fs::read_dir(&udc_base).ok()?;
    let in_use = ports_in_use(sysfs_root);

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();

    names.into_iter().find(|name| !in_use.contains(name))
}

/// Create the composite HID gadget tree rooted at `gadget_dir`.
///
/// The `UDC` attribute is deliberately left untouched; binding happens in
/// [`crate::Input::connect`] once endpoints are needed.
pub fn create_hid(gadget_dir: &Path) -> Result<()> {
    create_dirs(gadget_dir)?;

    write_attribute(gadget_dir, "bcdDevice", "0x0100")?;
    write_attribute(gadget_dir, "bcdUSB", "0x0200")?;
    write_attribute(gadget_dir, "idProduct", "0x0104")?;
    write_attribute(gadget_dir, "idVendor", "0x1d6b")?;

    let locale = locale_dir(gadget_dir);
    create_dirs(&locale)?;
    write_attribute(&locale, "manufacturer", "OpenBMC")?;
    write_attribute(&locale, "product", "Virtual Keyboard and Mouse")?;
    write_attribute(&locale, "serialnumber", "OBMC0001")?;

    let kbd_dir = keyboard_function_dir(gadget_dir);
    create_dirs(&kbd_dir)?;
    write_attribute(&kbd_dir, "protocol", "1")?;
    write_attribute(&kbd_dir, "report_length", "8")?;
    write_attribute(&kbd_dir, "subclass", "1")?;
    write_raw_attribute(&kbd_dir, "report_desc", &KEYBOARD_REPORT_DESC)?;

    let mouse_dir = mouse_function_dir(gadget_dir);
    create_dirs(&mouse_dir)?;
    write_attribute(&mouse_dir, "protocol", "2")?;
    write_attribute(&mouse_dir, "report_length", "6")?;
    write_attribute(&mouse_dir, "subclass", "1")?;
    write_raw_attribute(&mouse_dir, "report_desc", &MOUSE_REPORT_DESC)?;

    let config = config_dir(gadget_dir);
    create_dirs(&config)?;
    let config_locale = locale_dir(&config);
    create_dirs(&config_locale)?;
    write_attribute(&config, "bmAttributes", "0xe0")?;
    write_attribute(&config, "MaxPower", "200")?;
    write_attribute(&config_locale, "configuration", "")?;

    // Functions must be fully described before they are linked in.
    symlink(&kbd_dir, &config.join(KEYBOARD_FUNCTION))?;
    symlink(&mouse_dir, &config.join(MOUSE_FUNCTION))?;

    debug!("created HID gadget at {}", gadget_dir.display());
    Ok(())
}

fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|source| Error::Gadget {
        path: link.to_path_buf(),
        source,
    })
}

/// Tear the gadget tree down in reverse creation order.
///
/// The `strings`/`functions`/`configs` group directories are auto-created
/// by configfs and vanish with the gadget root there; on ordinary
/// filesystems (tests) they are real directories, so they are removed
/// best-effort between the user-created entries.
pub fn destroy_hid(gadget_dir: &Path) -> Result<()> {
    let config = config_dir(gadget_dir);
    remove_entry(&config.join(KEYBOARD_FUNCTION))?;
    remove_entry(&config.join(MOUSE_FUNCTION))?;
    remove_dir(&keyboard_function_dir(gadget_dir))?;
    remove_dir(&mouse_function_dir(gadget_dir))?;
    remove_dir(&locale_dir(&config))?;
    let _ = fs::remove_dir(config.join("strings"));
    remove_dir(&config)?;
    remove_dir(&locale_dir(gadget_dir))?;
    for stem in ["strings", "functions", "configs"] {
        let _ = fs::remove_dir(gadget_dir.join(stem));
    }
    remove_dir(gadget_dir)?;
    debug!("destroyed HID gadget at {}", gadget_dir.display());
    Ok(())
}

fn remove_entry(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|source| Error::Gadget {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove a gadget directory. configfs directories are removable while
/// their implicit attribute files still exist; on ordinary filesystems
/// (tests) any regular files inside are unlinked first.
fn remove_dir(path: &Path) -> Result<()> {
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    fs::remove_dir(path).map_err(|source| Error::Gadget {
        path: path.to_path_buf(),
        source,
    })
}
