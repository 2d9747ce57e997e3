// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! Screenshot request hand-off
//!
//! Shared state between an RPC front-end and the capture loop: the
//! front-end calls [`ScreenshotState::request`], the capture loop
//! observes [`ScreenshotState::pending`], dumps the frame to
//! [`ScreenshotState::path`], and clears the flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Where requested screenshots are written.
pub const SCREENSHOT_PATH: &str = "/tmp/screenshot.jpg";

/// In-band reply while a previous request is still being serviced.
pub const BUSY_REPLY: &str = "Screenshot busy";

#[derive(Default)]
pub struct ScreenshotState {
    path: Mutex<PathBuf>,
    pending: AtomicBool,
}

impl ScreenshotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a screenshot request. Returns the path the screenshot will
    /// be written to, or the literal busy reply if one is outstanding.
    pub fn request(&self) -> String {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let path = PathBuf::from(SCREENSHOT_PATH);
            let reply = path.display().to_string();
            *self.path.lock().expect("Failed to lock screenshot path mutex: another thread panicked while holding the lock") = path;
            reply
        } else {
            BUSY_REPLY.to_string()
        }
    }

    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn path(&self) -> PathBuf {
        self.path.lock().expect("Failed to lock screenshot path mutex: another thread panicked while holding the lock").clone()
    }

    /// Mark the outstanding request as serviced.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_returns_path() {
        let state = ScreenshotState::new();
        assert_eq!(state.request(), SCREENSHOT_PATH);
        assert!(state.pending());
        assert_eq!(state.path(), PathBuf::from(SCREENSHOT_PATH));
    }

    #[test]
    fn test_second_request_reports_busy() {
        let state = ScreenshotState::new();
        assert_eq!(state.request(), SCREENSHOT_PATH);
        assert_eq!(state.request(), BUSY_REPLY);
    }

    #[test]
    fn test_request_after_clear_succeeds() {
        let state = ScreenshotState::new();
        state.request();
        state.clear();
        assert!(!state.pending());
        assert_eq!(state.request(), SCREENSHOT_PATH);
    }
}
