// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! Embedded RFB 003.008 server layer
//!
//! The protocol plumbing the KVM server drives: listener and handshake,
//! per-client sockets, the event pump, and the wire-level encoding
//! primitives (raw rectangles, Tight pass-through, pre-compressed hextile
//! chunking, last-rect marker, DesktopSize and XCursor pseudo-encodings).
//!
//! Per-client user state lives in the `data: D` slot of [`Client`]; the
//! daemon reacts to protocol events through the [`EventHandler`] hooks.
//! Writes from the pump thread and the capture thread are serialized by a
//! per-client connection mutex; capability flags are atomics so both
//! threads can consult them without locking.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

pub const BITS_PER_SAMPLE: u8 = 8;
pub const SAMPLES_PER_PIXEL: u8 = 3;
pub const BYTES_PER_PIXEL: usize = 4;

/// Staged output per client, flushed whenever it fills.
pub const UPDATE_BUF_SIZE: usize = 30000;

/// `nRects` sentinel announcing a last-rect terminated update.
pub const LAST_RECT_COUNT: u16 = 0xffff;

const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
const SECURITY_NONE: u8 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_CUT_TEXT_LEN: usize = 1 << 20;

// client -> server message types
const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;
const MSG_CLIENT_CUT_TEXT: u8 = 6;

// server -> client
const MSG_FRAMEBUFFER_UPDATE: u8 = 0;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_TIGHT: i32 = 7;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
pub const ENCODING_LAST_RECT: i32 = -224;
pub const ENCODING_X_CURSOR: i32 = -240;

/// Tight subencoding nibble for JPEG; shifted into the control byte.
pub const TIGHT_JPEG: u8 = 0x09;

/// Server pixel format as sent in ServerInit (and never renegotiated;
/// the daemon passes the capture stream through untranslated).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Library default: 32 bpp true colour, 8 bits per sample.
    pub fn rgb888() -> Self {
        Self {
            bits_per_pixel: (BYTES_PER_PIXEL * 8) as u8,
            depth: BITS_PER_SAMPLE * SAMPLES_PER_PIXEL,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 5-6-5 component layout used for the RGB565 and hextile streams.
    pub fn rgb565() -> Self {
        Self {
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 0,
            green_shift: 5,
            blue_shift: 11,
            ..Self::rgb888()
        }
    }

    pub fn to_wire(self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[0] = self.bits_per_pixel;
        block[1] = self.depth;
        block[2] = self.big_endian as u8;
        block[3] = self.true_colour as u8;
        block[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        block[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        block[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        block[10] = self.red_shift;
        block[11] = self.green_shift;
        block[12] = self.blue_shift;
        block
    }
}

/// Two-color X cursor attached to the screen.
pub struct Cursor {
    pub width: u16,
    pub height: u16,
    pub xhot: u16,
    pub yhot: u16,
    source: Vec<u8>,
    mask: Vec<u8>,
}

impl Cursor {
    /// Build from 'x'/' ' pixel art: `source` marks foreground pixels,
    /// `mask` marks opaque pixels.
    pub fn from_art(source: &[&str], mask: &[&str], xhot: u16, yhot: u16) -> Self {
        let height = source.len() as u16;
        let width = source.first().map(|r| r.len()).unwrap_or(0) as u16;
        Self {
            width,
            height,
            xhot,
            yhot,
            source: pack_bitmap(source, width),
            mask: pack_bitmap(mask, width),
        }
    }

    /// The standard 20x20 pointer arrow with hotspot (1, 1).
    pub fn pointer_arrow() -> Self {
        const ARROW: [&str; 20] = [
            "x                   ",
            "xx                  ",
            "xxx                 ",
            "xxxx                ",
            "xxxxx               ",
            "xxxxxx              ",
            "xxxxxxx             ",
            "xxxxxxxx            ",
            "xxxxxxxxx           ",
            "xxxxxxxxxx          ",
            "xxxxxxxxxxx         ",
            "xxxxxxx             ",
            "xxxx xxx            ",
            "xxx  xxx            ",
            "xx    xxx           ",
            "x     xxx           ",
            "       xxx          ",
            "       xxx          ",
            "        xx          ",
            "                    ",
        ];
        Self::from_art(&ARROW, &ARROW, 1, 1)
    }
}

fn pack_bitmap(rows: &[&str], width: u16) -> Vec<u8> {
    let stride = (width as usize + 7) / 8;
    let mut bits = vec![0u8; stride * rows.len()];
    for (y, row) in rows.iter().enumerate() {
        for (x, ch) in row.chars().enumerate() {
            if ch != ' ' {
                bits[y * stride + x / 8] |= 0x80 >> (x % 8);
            }
        }
    }
    bits
}

struct Framebuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

struct Conn {
    stream: TcpStream,
    update_buf: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl Conn {
    /// Stage bytes for the client, flushing whenever the update buffer
    /// reaches capacity (the hextile/tight chunking protocol).
    fn queue(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let space = UPDATE_BUF_SIZE - self.update_buf.len();
            if space == 0 {
                self.flush()?;
                continue;
            }
            let take = space.min(data.len());
            self.update_buf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.update_buf.is_empty() {
            write_all_polled(&mut self.stream, &self.update_buf)?;
            self.update_buf.clear();
        }
        Ok(())
    }
}

/// `write_all` for a nonblocking socket: on `WouldBlock`, poll for
/// writability (bounded by [`WRITE_TIMEOUT`]) and continue.
fn write_all_polled(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    let deadline = Instant::now() + WRITE_TIMEOUT;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                // SAFETY: the stream outlives the poll call.
                let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
                let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                let millis = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
                poll(&mut fds, PollTimeout::from(millis))
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One connected RFB client.
pub struct Client<D> {
    conn: Mutex<Conn>,
    fd: RawFd,
    peer: SocketAddr,
    enable_last_rect: AtomicBool,
    enable_desktop_size: AtomicBool,
    enable_x_cursor: AtomicBool,
    /// Protocol-level: an update request is outstanding.
    update_pending: AtomicBool,
    /// Framebuffer content changed since this client last saw it.
    modified: AtomicBool,
    cursor_pending: AtomicBool,
    dead: AtomicBool,
    /// Per-client user state (the library's opaque client-data slot).
    pub data: D,
}

impl<D> Client<D> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn enables_last_rect(&self) -> bool {
        self.enable_last_rect.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    fn kill(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    /// Take the connection for one whole update. Holding the writer
    /// keeps updates from the pump and capture threads from interleaving
    /// on the wire.
    pub fn writer(&self) -> ClientWriter<'_, D> {
        ClientWriter {
            client: self,
            conn: self.conn.lock().expect("Failed to lock client connection mutex: another thread panicked while holding the lock"),
        }
    }
}

/// Exclusive access to a client's outgoing stream for one update.
pub struct ClientWriter<'a, D> {
    client: &'a Client<D>,
    conn: std::sync::MutexGuard<'a, Conn>,
}

impl<D> ClientWriter<'_, D> {
    /// FramebufferUpdate message header.
    pub fn send_update_header(&mut self, n_rects: u16) -> io::Result<()> {
        let mut header = [MSG_FRAMEBUFFER_UPDATE, 0, 0, 0];
        header[2..4].copy_from_slice(&n_rects.to_be_bytes());
        self.queue(&header)
    }

    /// Rectangle header introducing a Tight-encoded rect.
    pub fn send_tight_header(&mut self, x: u16, y: u16, w: u16, h: u16) -> io::Result<()> {
        self.queue(&rect_header(x, y, w, h, ENCODING_TIGHT))
    }

    /// Tight JPEG subencoding: control byte, compact length, payload.
    pub fn send_tight_jpeg_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.queue(&[TIGHT_JPEG << 4])?;
        self.queue(&tight_compact_len(data.len()))?;
        self.queue(data)
    }

    /// Pre-compressed hextile stream, chunked through the update buffer.
    pub fn send_hextile_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.queue(data)
    }

    pub fn send_last_rect_marker(&mut self) -> io::Result<()> {
        self.queue(&rect_header(0, 0, 0, 0, ENCODING_LAST_RECT))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.conn.flush().map_err(|e| {
            self.client.kill();
            e
        })
    }

    fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        self.conn.queue(data).map_err(|e| {
            self.client.kill();
            e
        })
    }
}

fn rect_header(x: u16, y: u16, w: u16, h: u16, encoding: i32) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..2].copy_from_slice(&x.to_be_bytes());
    header[2..4].copy_from_slice(&y.to_be_bytes());
    header[4..6].copy_from_slice(&w.to_be_bytes());
    header[6..8].copy_from_slice(&h.to_be_bytes());
    header[8..12].copy_from_slice(&encoding.to_be_bytes());
    header
}

/// Tight compact length: 7 bits per byte, little-endian, continuation
/// high bit, at most three bytes.
fn tight_compact_len(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.push((len & 0x7f) as u8 | 0x80);
        out.push((len >> 7) as u8);
    } else {
        out.push((len & 0x7f) as u8 | 0x80);
        out.push(((len >> 7) & 0x7f) as u8 | 0x80);
        out.push((len >> 14) as u8);
    }
    out
}

/// Hooks invoked by the event pump. Implementations must be callable
/// from the pump thread while other threads hold client data.
pub trait EventHandler<D> {
    fn client_joined(&self, client: &Arc<Client<D>>);
    fn client_left(&self, client: &Arc<Client<D>>);
    fn key_event(&self, down: bool, keysym: u32, client: &Arc<Client<D>>);
    fn pointer_event(&self, button_mask: u8, x: u16, y: u16, client: &Arc<Client<D>>);
    fn update_requested(&self, client: &Arc<Client<D>>);
}

enum ClientMessage {
    SetEncodings(Vec<i32>),
    UpdateRequest,
    Key { down: bool, keysym: u32 },
    Pointer { mask: u8, x: u16, y: u16 },
    Ignored,
}

/// The RFB screen: listener, framebuffer, pixel format, clients.
pub struct Screen<D> {
    listener: TcpListener,
    desktop_name: String,
    format: Mutex<PixelFormat>,
    fb: Mutex<Framebuffer>,
    clients: Mutex<Vec<Arc<Client<D>>>>,
    cursor: Cursor,
}

impl<D: Default + Send + Sync> Screen<D> {
    pub fn new(
        port: u16,
        desktop_name: &str,
        width: u32,
        height: u32,
        format: PixelFormat,
        cursor: Cursor,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!(
            "RFB server listening on {} ({}x{})",
            listener.local_addr()?,
            width,
            height
        );
        Ok(Self {
            listener,
            desktop_name: desktop_name.to_string(),
            format: Mutex::new(format),
            fb: Mutex::new(Framebuffer {
                data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
                width,
                height,
            }),
            clients: Mutex::new(Vec::new()),
            cursor,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("Failed to lock client list mutex: another thread panicked while holding the lock").len()
    }

    /// Snapshot of the connected clients.
    pub fn clients(&self) -> Vec<Arc<Client<D>>> {
        self.clients.lock().expect("Failed to lock client list mutex: another thread panicked while holding the lock").clone()
    }

    pub fn width(&self) -> u32 {
        self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock").width
    }

    pub fn height(&self) -> u32 {
        self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock").height
    }

    pub fn framebuffer_len(&self) -> usize {
        self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock").data.len()
    }

    pub fn set_pixel_format(&self, format: PixelFormat) {
        *self.format.lock().expect("Failed to lock pixel format mutex: another thread panicked while holding the lock") = format;
    }

    /// Copy frame bytes into the shared framebuffer (raw formats).
    pub fn copy_to_framebuffer(&self, data: &[u8]) {
        let mut fb = self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock");
        let n = data.len().min(fb.data.len());
        fb.data[..n].copy_from_slice(&data[..n]);
    }

    /// Flag every client's view of the framebuffer as stale.
    pub fn mark_modified(&self) {
        for client in self.clients.lock().expect("Failed to lock client list mutex: another thread panicked while holding the lock").iter() {
            client.modified.store(true, Ordering::Relaxed);
        }
    }

    /// Reallocate the framebuffer (zeroed) and announce the new geometry
    /// to clients that understand DesktopSize.
    pub fn set_framebuffer(&self, width: u32, height: u32) {
        {
            let mut fb = self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock");
            fb.width = width;
            fb.height = height;
            fb.data = vec![0; width as usize * height as usize * BYTES_PER_PIXEL];
        }
        for client in self.clients() {
            if !client.enable_desktop_size.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(e) = self.send_desktop_size(&client, width, height) {
                warn!("failed to announce resize to {}: {e}", client.peer());
            }
        }
    }

    fn send_desktop_size(
        &self,
        client: &Arc<Client<D>>,
        width: u32,
        height: u32,
    ) -> io::Result<()> {
        let mut writer = client.writer();
        writer.send_update_header(1)?;
        writer.queue(&rect_header(
            0,
            0,
            width as u16,
            height as u16,
            ENCODING_DESKTOP_SIZE,
        ))?;
        writer.flush()
    }

    /// Pump protocol events for up to `budget`, dispatching hooks and
    /// servicing raw-framebuffer updates.
    pub fn process_events<H: EventHandler<D>>(&self, budget: Duration, handler: &H) {
        let deadline = Instant::now() + budget;
        loop {
            self.accept_new(handler);
            let worked = self.service_clients(handler);
            self.send_pending_updates();
            self.reap_dead(handler);

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if !worked {
                self.wait_for_activity(deadline - now);
            }
        }
    }

    fn accept_new<H: EventHandler<D>>(&self, handler: &H) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.handshake(stream, peer) {
                    Ok(client) => {
                        info!("client {} connected", peer);
                        self.clients.lock().expect("Failed to lock client list mutex: another thread panicked while holding the lock").push(client.clone());
                        handler.client_joined(&client);
                    }
                    Err(e) => warn!("handshake with {peer} failed: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handshake(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<Arc<Client<D>>> {
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_nodelay(true)?;

        stream.write_all(PROTOCOL_VERSION)?;
        let mut version = [0u8; 12];
        stream.read_exact(&mut version)?;
        if &version[..4] != b"RFB " {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not an RFB client",
            ));
        }

        stream.write_all(&[1, SECURITY_NONE])?;
        let mut selected = [0u8; 1];
        stream.read_exact(&mut selected)?;
        if selected[0] != SECURITY_NONE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client selected an unsupported security type",
            ));
        }
        stream.write_all(&0u32.to_be_bytes())?; // SecurityResult: OK

        let mut client_init = [0u8; 1];
        stream.read_exact(&mut client_init)?; // shared flag, ignored

        let (width, height) = {
            let fb = self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock");
            (fb.width as u16, fb.height as u16)
        };
        let format = *self.format.lock().expect("Failed to lock pixel format mutex: another thread panicked while holding the lock");
        let mut server_init = Vec::with_capacity(24 + self.desktop_name.len());
        server_init.extend_from_slice(&width.to_be_bytes());
        server_init.extend_from_slice(&height.to_be_bytes());
        server_init.extend_from_slice(&format.to_wire());
        server_init.extend_from_slice(&(self.desktop_name.len() as u32).to_be_bytes());
        server_init.extend_from_slice(self.desktop_name.as_bytes());
        stream.write_all(&server_init)?;

        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Arc::new(Client {
            conn: Mutex::new(Conn {
                stream,
                update_buf: Vec::with_capacity(UPDATE_BUF_SIZE),
                recv_buf: Vec::new(),
            }),
            fd,
            peer,
            enable_last_rect: AtomicBool::new(false),
            enable_desktop_size: AtomicBool::new(false),
            enable_x_cursor: AtomicBool::new(false),
            update_pending: AtomicBool::new(false),
            modified: AtomicBool::new(true),
            cursor_pending: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            data: D::default(),
        }))
    }

    fn service_clients<H: EventHandler<D>>(&self, handler: &H) -> bool {
        let mut worked = false;
        for client in self.clients() {
            if client.is_dead() {
                continue;
            }
            let messages = {
                let mut conn = client.conn.lock().expect("Failed to lock client connection mutex: another thread panicked while holding the lock");
                let mut chunk = [0u8; 4096];
                loop {
                    match conn.stream.read(&mut chunk) {
                        Ok(0) => {
                            client.kill();
                            break;
                        }
                        Ok(n) => {
                            conn.recv_buf.extend_from_slice(&chunk[..n]);
                            worked = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("read from {} failed: {e}", client.peer());
                            client.kill();
                            break;
                        }
                    }
                }
                let mut messages = Vec::new();
                while let Some(message) = parse_message(&mut conn.recv_buf) {
                    match message {
                        Ok(m) => messages.push(m),
                        Err(kind) => {
                            warn!("client {} sent message type {kind}", client.peer());
                            client.kill();
                            break;
                        }
                    }
                }
                messages
            };

            for message in messages {
                self.dispatch(&client, message, handler);
            }
        }
        worked
    }

    fn dispatch<H: EventHandler<D>>(
        &self,
        client: &Arc<Client<D>>,
        message: ClientMessage,
        handler: &H,
    ) {
        match message {
            ClientMessage::SetEncodings(encodings) => {
                for encoding in encodings {
                    match encoding {
                        ENCODING_LAST_RECT => {
                            client.enable_last_rect.store(true, Ordering::Relaxed)
                        }
                        ENCODING_DESKTOP_SIZE => {
                            client.enable_desktop_size.store(true, Ordering::Relaxed)
                        }
                        ENCODING_X_CURSOR => {
                            client.enable_x_cursor.store(true, Ordering::Relaxed);
                            client.cursor_pending.store(true, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
            }
            ClientMessage::UpdateRequest => {
                // full-frame policy: the requested rectangle is ignored
                client.update_pending.store(true, Ordering::Relaxed);
                handler.update_requested(client);
            }
            ClientMessage::Key { down, keysym } => handler.key_event(down, keysym, client),
            ClientMessage::Pointer { mask, x, y } => {
                handler.pointer_event(mask, x, y, client)
            }
            ClientMessage::Ignored => {}
        }
    }

    /// Push raw framebuffer updates and queued cursor shapes to clients
    /// with an outstanding request.
    fn send_pending_updates(&self) {
        for client in self.clients() {
            if client.is_dead() || !client.update_pending.load(Ordering::Relaxed) {
                continue;
            }
            if client.cursor_pending.swap(false, Ordering::Relaxed) {
                client.update_pending.store(false, Ordering::Relaxed);
                if let Err(e) = self.send_cursor(&client) {
                    debug!("cursor update to {} failed: {e}", client.peer());
                }
                continue;
            }
            if !client.modified.load(Ordering::Relaxed) {
                continue;
            }
            client.update_pending.store(false, Ordering::Relaxed);
            client.modified.store(false, Ordering::Relaxed);
            if let Err(e) = self.send_raw_update(&client) {
                debug!("raw update to {} failed: {e}", client.peer());
            }
        }
    }

    fn send_raw_update(&self, client: &Arc<Client<D>>) -> io::Result<()> {
        let fb = self.fb.lock().expect("Failed to lock framebuffer mutex: another thread panicked while holding the lock");
        let mut writer = client.writer();
        writer.send_update_header(1)?;
        writer.queue(&rect_header(
            0,
            0,
            fb.width as u16,
            fb.height as u16,
            ENCODING_RAW,
        ))?;
        writer.queue(&fb.data)?;
        drop(fb);
        writer.flush()
    }

    fn send_cursor(&self, client: &Arc<Client<D>>) -> io::Result<()> {
        let c = &self.cursor;
        let mut writer = client.writer();
        writer.send_update_header(1)?;
        writer.queue(&rect_header(
            c.xhot,
            c.yhot,
            c.width,
            c.height,
            ENCODING_X_CURSOR,
        ))?;
        // primary then secondary color, then source bits, then mask bits
        writer.queue(&[0xff, 0xff, 0xff, 0x00, 0x00, 0x00])?;
        writer.queue(&c.source)?;
        writer.queue(&c.mask)?;
        writer.flush()
    }

    fn reap_dead<H: EventHandler<D>>(&self, handler: &H) {
        let dead: Vec<Arc<Client<D>>> = {
            let mut clients = self.clients.lock().expect("Failed to lock client list mutex: another thread panicked while holding the lock");
            let (dead, alive): (Vec<_>, Vec<_>) =
                clients.drain(..).partition(|c| c.is_dead());
            *clients = alive;
            dead
        };
        for client in dead {
            info!("client {} disconnected", client.peer());
            handler.client_left(&client);
        }
    }

    fn wait_for_activity(&self, timeout: Duration) {
        let mut fds = Vec::new();
        // SAFETY: the fds outlive the poll call; clients are kept alive
        // by the list snapshot below.
        let listener_fd = unsafe { BorrowedFd::borrow_raw(self.listener.as_raw_fd()) };
        fds.push(PollFd::new(listener_fd, PollFlags::POLLIN));
        let clients = self.clients();
        for client in &clients {
            if client.is_dead() {
                continue;
            }
            let fd = unsafe { BorrowedFd::borrow_raw(client.fd) };
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        let millis = timeout.as_millis().clamp(1, u16::MAX as u128) as u16;
        let _ = poll(&mut fds, PollTimeout::from(millis));
    }
}

/// Extract one complete client message from the receive buffer.
/// `Err(type)` reports an unknown message type (protocol error).
fn parse_message(buf: &mut Vec<u8>) -> Option<Result<ClientMessage, u8>> {
    if buf.is_empty() {
        return None;
    }
    let (consumed, message) = match buf[0] {
        MSG_SET_PIXEL_FORMAT => {
            if buf.len() < 20 {
                return None;
            }
            (20, ClientMessage::Ignored)
        }
        MSG_SET_ENCODINGS => {
            if buf.len() < 4 {
                return None;
            }
            let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let total = 4 + count * 4;
            if buf.len() < total {
                return None;
            }
            let encodings = buf[4..total]
                .chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            (total, ClientMessage::SetEncodings(encodings))
        }
        MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            if buf.len() < 10 {
                return None;
            }
            (10, ClientMessage::UpdateRequest)
        }
        MSG_KEY_EVENT => {
            if buf.len() < 8 {
                return None;
            }
            let down = buf[1] != 0;
            let keysym = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            (8, ClientMessage::Key { down, keysym })
        }
        MSG_POINTER_EVENT => {
            if buf.len() < 6 {
                return None;
            }
            let mask = buf[1];
            let x = u16::from_be_bytes([buf[2], buf[3]]);
            let y = u16::from_be_bytes([buf[4], buf[5]]);
            (6, ClientMessage::Pointer { mask, x, y })
        }
        MSG_CLIENT_CUT_TEXT => {
            if buf.len() < 8 {
                return None;
            }
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if len > MAX_CUT_TEXT_LEN {
                // refuse to buffer unbounded clipboard payloads
                return Some(Err(MSG_CLIENT_CUT_TEXT));
            }
            let total = 8 + len;
            if buf.len() < total {
                return None;
            }
            (total, ClientMessage::Ignored) // clipboard transfer unsupported
        }
        unknown => return Some(Err(unknown)),
    };
    buf.drain(..consumed);
    Some(Ok(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_wire_block() {
        let block = PixelFormat::rgb888().to_wire();
        assert_eq!(block[0], 32); // bpp
        assert_eq!(block[1], 24); // depth
        assert_eq!(block[2], 0); // little endian
        assert_eq!(block[3], 1); // true colour
        assert_eq!(&block[4..6], &[0, 255]); // red max BE
        assert_eq!(block[10], 16); // red shift
    }

    #[test]
    fn test_pixel_format_565_derivation() {
        let f = PixelFormat::rgb565();
        assert_eq!((f.red_max, f.green_max, f.blue_max), (31, 63, 31));
        assert_eq!((f.red_shift, f.green_shift, f.blue_shift), (0, 5, 11));
        // the rest stays at the library default
        assert_eq!(f.bits_per_pixel, 32);
    }

    #[test]
    fn test_tight_compact_len() {
        assert_eq!(tight_compact_len(10), vec![0x0a]);
        assert_eq!(tight_compact_len(0x7f), vec![0x7f]);
        assert_eq!(tight_compact_len(200), vec![0xc8, 0x01]);
        assert_eq!(tight_compact_len(20000), vec![0xa0, 0x9c, 0x01]);
    }

    #[test]
    fn test_rect_header_layout() {
        let header = rect_header(1, 2, 640, 480, ENCODING_TIGHT);
        assert_eq!(&header[0..2], &[0, 1]);
        assert_eq!(&header[2..4], &[0, 2]);
        assert_eq!(&header[4..6], &640u16.to_be_bytes());
        assert_eq!(&header[6..8], &480u16.to_be_bytes());
        assert_eq!(&header[8..12], &7i32.to_be_bytes());
    }

    #[test]
    fn test_last_rect_header_encoding() {
        let header = rect_header(0, 0, 0, 0, ENCODING_LAST_RECT);
        assert_eq!(&header[8..12], &(-224i32).to_be_bytes());
    }

    #[test]
    fn test_parse_key_event() {
        let mut buf = vec![MSG_KEY_EVENT, 1, 0, 0, 0, 0, 0, 0x41];
        match parse_message(&mut buf) {
            Some(Ok(ClientMessage::Key { down, keysym })) => {
                assert!(down);
                assert_eq!(keysym, 0x41);
            }
            _ => panic!("expected key event"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_partial_message_waits() {
        let mut buf = vec![MSG_KEY_EVENT, 1, 0];
        assert!(parse_message(&mut buf).is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_parse_pointer_event() {
        let mut buf = vec![MSG_POINTER_EVENT, 0x01, 0x03, 0xc0, 0x02, 0x1c];
        match parse_message(&mut buf) {
            Some(Ok(ClientMessage::Pointer { mask, x, y })) => {
                assert_eq!(mask, 1);
                assert_eq!(x, 960);
                assert_eq!(y, 540);
            }
            _ => panic!("expected pointer event"),
        }
    }

    #[test]
    fn test_parse_set_encodings() {
        let mut buf = vec![MSG_SET_ENCODINGS, 0, 0, 2];
        buf.extend_from_slice(&7i32.to_be_bytes());
        buf.extend_from_slice(&(-224i32).to_be_bytes());
        match parse_message(&mut buf) {
            Some(Ok(ClientMessage::SetEncodings(encodings))) => {
                assert_eq!(encodings, vec![7, -224]);
            }
            _ => panic!("expected set-encodings"),
        }
    }

    #[test]
    fn test_parse_cut_text_discarded() {
        let mut buf = vec![MSG_CLIENT_CUT_TEXT, 0, 0, 0, 0, 0, 0, 3];
        buf.extend_from_slice(b"abc");
        buf.push(MSG_FRAMEBUFFER_UPDATE_REQUEST);
        assert!(matches!(
            parse_message(&mut buf),
            Some(Ok(ClientMessage::Ignored))
        ));
        assert_eq!(buf, vec![MSG_FRAMEBUFFER_UPDATE_REQUEST]);
    }

    #[test]
    fn test_parse_unknown_type_is_error() {
        let mut buf = vec![0x99];
        assert!(matches!(parse_message(&mut buf), Some(Err(0x99))));
    }

    #[test]
    fn test_cursor_bitmap_packing() {
        let cursor = Cursor::pointer_arrow();
        assert_eq!(cursor.width, 20);
        assert_eq!(cursor.height, 20);
        assert_eq!((cursor.xhot, cursor.yhot), (1, 1));
        // 20 bits -> 3 bytes per row
        assert_eq!(cursor.source.len(), 3 * 20);
        // first row: single leading pixel
        assert_eq!(cursor.source[0], 0x80);
        // second row: two leading pixels
        assert_eq!(cursor.source[3], 0xc0);
    }

    #[test]
    fn test_update_buffer_chunking() {
        // a Conn with a sink stream is exercised via the loopback test in
        // tests/integration.rs; here we check the chunk arithmetic
        assert_eq!(UPDATE_BUF_SIZE, 30000);
        let payload = vec![0u8; UPDATE_BUF_SIZE * 2 + 17];
        let mut chunks = Vec::new();
        let mut staged = 0usize;
        let mut off = 0usize;
        while off < payload.len() {
            let space = UPDATE_BUF_SIZE - staged;
            if space == 0 {
                chunks.push(staged);
                staged = 0;
                continue;
            }
            let take = space.min(payload.len() - off);
            staged += take;
            off += take;
        }
        chunks.push(staged);
        assert_eq!(chunks, vec![UPDATE_BUF_SIZE, UPDATE_BUF_SIZE, 17]);
    }
}
