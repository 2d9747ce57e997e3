// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! V4L2 kernel ABI subset
//!
//! Only the pieces of `<linux/videodev2.h>` the capture pipeline needs:
//! capability query, format negotiation, mmap streaming I/O, DV timings,
//! stream parameters, and the JPEG chroma-subsampling control. Layouts
//! match the 64-bit kernel ABI.

use bitflags::bitflags;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

pub const PIX_FMT_RGB24: u32 = fourcc(b'R', b'G', b'B', b'3');
pub const PIX_FMT_RGB565: u32 = fourcc(b'R', b'G', b'B', b'P');
pub const PIX_FMT_JPEG: u32 = fourcc(b'J', b'P', b'E', b'G');
/// Pre-compressed RFB hextile stream produced by BMC video engines.
pub const PIX_FMT_HEXTILE: u32 = fourcc(b'H', b'X', b'T', b'L');

pub const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const MEMORY_MMAP: u32 = 1;

pub const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const CAP_STREAMING: u32 = 0x0400_0000;

/// `V4L2_CID_JPEG_CHROMA_SUBSAMPLING`
pub const CID_JPEG_CHROMA_SUBSAMPLING: u32 = 0x009d_0901;
pub const JPEG_CHROMA_SUBSAMPLING_444: i32 = 0;
pub const JPEG_CHROMA_SUBSAMPLING_420: i32 = 2;

bitflags! {
    /// `v4l2_buffer.flags` bits the dequeue path cares about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const MAPPED = 0x0000_0001;
        const QUEUED = 0x0000_0002;
        const DONE = 0x0000_0004;
        const ERROR = 0x0000_0040;
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// `v4l2_format` with the `fmt` union modeled as the `pix` member plus
/// padding out to the union's 200 bytes (8-aligned on 64-bit).
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct Format {
    pub typ: u32,
    _pad: u32,
    pub pix: PixFormat,
    _reserved: [u8; 152],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestBuffers {
    pub count: u32,
    pub typ: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Timecode {
    pub typ: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

/// `v4l2_buffer` for MMAP streaming; the `m` union is modeled as the
/// `offset` member plus padding for the pointer-sized tail.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Buffer {
    pub index: u32,
    pub typ: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    _pad: u32,
    pub timestamp: libc::timeval,
    pub timecode: Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m_offset: u32,
    _m_pad: u32,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtTimings {
    pub width: u32,
    pub height: u32,
    pub interlaced: u32,
    pub polarities: u32,
    pub pixelclock: u64,
    pub hfrontporch: u32,
    pub hsync: u32,
    pub hbackporch: u32,
    pub vfrontporch: u32,
    pub vsync: u32,
    pub vbackporch: u32,
    pub il_vfrontporch: u32,
    pub il_vsync: u32,
    pub il_vbackporch: u32,
    pub standards: u32,
    pub flags: u32,
    pub picture_aspect: Fract,
    pub cea861_vic: u8,
    pub hdmi_vic: u8,
    pub reserved: [u8; 46],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DvTimings {
    pub typ: u32,
    pub bt: BtTimings,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

/// `v4l2_streamparm` with the `parm` union modeled as the capture member
/// plus padding out to the union's 200 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StreamParm {
    pub typ: u32,
    pub capture: CaptureParm,
    _reserved: [u8; 160],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Control {
    pub id: u32,
    pub value: i32,
}

macro_rules! zeroed_new {
    ($($t:ty),+) => {
        $(impl $t {
            /// All-zero value, the conventional starting point for ioctl
            /// argument structs.
            pub fn zeroed() -> Self {
                // SAFETY: plain-old-data struct; all-zero is a valid value.
                unsafe { std::mem::zeroed() }
            }
        })+
    };
}

zeroed_new!(
    Capability,
    Format,
    RequestBuffers,
    Buffer,
    DvTimings,
    StreamParm,
    Control
);

ioctl_read!(vidioc_querycap, b'V', 0, Capability);
ioctl_readwrite!(vidioc_g_fmt, b'V', 4, Format);
ioctl_readwrite!(vidioc_s_fmt, b'V', 5, Format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, RequestBuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, Buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, Buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, Buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
ioctl_readwrite!(vidioc_g_parm, b'V', 21, StreamParm);
ioctl_readwrite!(vidioc_s_parm, b'V', 22, StreamParm);
ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, Control);
ioctl_readwrite!(vidioc_s_dv_timings, b'V', 87, DvTimings);
ioctl_read!(vidioc_query_dv_timings, b'V', 99, DvTimings);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_fourcc_values() {
        assert_eq!(PIX_FMT_RGB24, 0x3342_4752);
        assert_eq!(PIX_FMT_JPEG, 0x4745_504a);
    }

    // Layouts below mirror the 64-bit kernel ABI; a mismatch here means
    // every ioctl in video.rs would corrupt memory.
    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_abi_struct_sizes() {
        assert_eq!(size_of::<Capability>(), 104);
        assert_eq!(size_of::<PixFormat>(), 48);
        assert_eq!(size_of::<Format>(), 208);
        assert_eq!(size_of::<RequestBuffers>(), 20);
        assert_eq!(size_of::<Timecode>(), 16);
        assert_eq!(size_of::<Buffer>(), 88);
        assert_eq!(size_of::<BtTimings>(), 124);
        assert_eq!(size_of::<DvTimings>(), 132);
        assert_eq!(size_of::<CaptureParm>(), 40);
        assert_eq!(size_of::<StreamParm>(), 204);
        assert_eq!(size_of::<Control>(), 8);
    }

    #[test]
    fn test_buffer_flags() {
        let flags = BufferFlags::from_bits_truncate(0x42);
        assert!(flags.contains(BufferFlags::ERROR));
        assert!(flags.contains(BufferFlags::QUEUED));
        assert!(!flags.contains(BufferFlags::DONE));
    }
}
