// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! ikvmd — headless KVM-over-IP daemon
//!
//! Captures the host's video output from a V4L2 device, serves it to RFB
//! (VNC) clients, and injects client keyboard/pointer events into the
//! host as USB HID traffic through a gadget created in configfs.

use std::path::PathBuf;

pub mod gadget;
pub mod input;
pub mod keymap;
pub mod manager;
pub mod rfb;
pub mod screenshot;
pub mod server;
pub mod v4l2;
pub mod video;

pub use input::Input;
pub use manager::{Config, Manager};
pub use screenshot::ScreenshotState;
pub use server::Server;
pub use video::{CaptureFormat, Video};

/// Daemon error type. Startup errors are fatal and carry the offending
/// path or ioctl; fast-path errors are logged at their source instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Device {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("gadget attribute {}: {source}", path.display())]
    Gadget {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{op}: {source}")]
    Ioctl {
        op: &'static str,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
