//! Framebuffer Screen
//!
//! Software screen backed by a Linux framebuffer device (`/dev/fb0` by
//! default): queries fixed/variable screen info via ioctl, memory-maps the
//! buffer and draws in place. Single buffer, synchronous present, tearing
//! accepted. Every construction failure (open/ioctl/mmap) is fatal to this
//! screen instance and propagates to the caller.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::geometry::{DamageArray, Rect, Size};
use crate::screen::{clip_to_screen, PixelFormat, Screen, SurfaceMut};

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

/// `struct fb_var_screeninfo` from `<linux/fb.h>`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo` from `<linux/fb.h>`
#[repr(C)]
#[derive(Clone, Copy)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

impl Default for FbFixScreeninfo {
    fn default() -> Self {
        // All-zero is a valid initial value for an ioctl out-parameter.
        unsafe { std::mem::zeroed() }
    }
}

fn ioctl<T>(file: &File, request: libc::c_ulong, value: &mut T) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, value as *mut T) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Map the framebuffer's reported pixel layout onto a toolkit format
fn format_from_var(var: &FbVarScreeninfo) -> Result<PixelFormat> {
    match var.bits_per_pixel {
        32 if var.transp.length > 0 => Ok(PixelFormat::Argb8888),
        32 => Ok(PixelFormat::Xrgb8888),
        16 => Ok(PixelFormat::Rgb565),
        depth => Err(Error::UnsupportedDepth(depth)),
    }
}

pub struct FramebufferScreen {
    _file: File,
    map: MmapMut,
    size: Size,
    format: PixelFormat,
    stride: usize,
    damage: DamageArray,
}

impl FramebufferScreen {
    /// Open and map a framebuffer device
    ///
    /// Reads the variable screen info for resolution and pixel layout, the
    /// fixed info for line stride and buffer length, then maps the buffer
    /// read-write. Any failure propagates; there is no retry.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;

        let mut var = FbVarScreeninfo::default();
        ioctl(&file, FBIOGET_VSCREENINFO, &mut var)
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;

        let mut fix = FbFixScreeninfo::default();
        ioctl(&file, FBIOGET_FSCREENINFO, &mut fix)
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;

        let format = format_from_var(&var)?;
        let size = Size::new(var.xres, var.yres);
        let stride = fix.line_length as usize;

        let map = unsafe { MmapOptions::new().len(fix.smem_len as usize).map_mut(&file) }
            .map_err(Error::Map)?;

        info!(
            "Framebuffer {:?}: {}x{} {:?}, stride {}, {} bytes mapped",
            path, size.width, size.height, format, stride, fix.smem_len
        );

        Ok(Self {
            _file: file,
            map,
            size,
            format,
            stride,
            damage: DamageArray::new(),
        })
    }
}

impl Screen for FramebufferScreen {
    fn size(&self) -> Size {
        self.size
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn buffer_count(&self) -> usize {
        1
    }

    fn current_buffer(&self) -> usize {
        0
    }

    fn add_damage(&mut self, rect: Rect) {
        if let Some(clipped) = clip_to_screen(rect, self.size) {
            self.damage.add(clipped);
        }
    }

    fn pending_damage(&self) -> &DamageArray {
        &self.damage
    }

    fn with_surface(&mut self, f: &mut dyn FnMut(&mut SurfaceMut<'_>)) -> Result<()> {
        let mut surface = SurfaceMut {
            data: &mut self.map[..],
            size: self.size,
            stride: self.stride,
            format: self.format,
        };
        f(&mut surface);
        Ok(())
    }

    fn schedule_flip(&mut self) -> Result<bool> {
        if self.damage.is_empty() {
            return Ok(false);
        }
        // Drawing happened in place in the mapped buffer; presenting is the
        // synchronous completion of that write.
        debug!("Framebuffer present, {} damage rects", self.damage.rects().len());
        self.damage.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_var() {
        let mut var = FbVarScreeninfo::default();
        var.bits_per_pixel = 32;
        assert_eq!(format_from_var(&var).unwrap(), PixelFormat::Xrgb8888);
        var.transp.length = 8;
        assert_eq!(format_from_var(&var).unwrap(), PixelFormat::Argb8888);
        var.bits_per_pixel = 16;
        assert_eq!(format_from_var(&var).unwrap(), PixelFormat::Rgb565);
        var.bits_per_pixel = 24;
        assert!(matches!(format_from_var(&var), Err(Error::UnsupportedDepth(24))));
    }

    #[test]
    fn test_missing_device_is_construction_error() {
        let result = FramebufferScreen::open(Path::new("/dev/egret-no-such-fb"));
        assert!(matches!(result, Err(Error::Device { .. })));
    }
}
