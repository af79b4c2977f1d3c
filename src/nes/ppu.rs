use tracing::trace;

use super::error::CoreError;
use super::mapper::{Mapper, Mirroring};
use super::palette;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CYCLES_PER_SCANLINE: u16 = 341;
const SCANLINES_PER_FRAME: u16 = 262;

const FRAME_END: (u16, u16) = (240, 256);
const VBLANK_START: (u16, u16) = (241, 1);
const PRE_RENDER: (u16, u16) = (261, 1);

const CTRL_NAMETABLE: u8 = 0x03;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const SPRITE_FLIP_Y: u8 = 0x80;
const SPRITE_FLIP_X: u8 = 0x40;
const SPRITE_BEHIND_BG: u8 = 0x20;

const ATTRIBUTE_TABLE_OFFSET: u16 = 960;
const SPRITE_PALETTE_BASE: u16 = 0x3F10;
const OFFSCREEN_SPRITE_Y: u8 = 0xFF;

/// Scanline/cycle positions the frame driver reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// (240, 256): the framebuffer holds a finished frame.
    FrameEnd,
    /// (241, 1): vblank flag raised, NMI may follow.
    VblankStart,
    /// (261, 1): status flags cleared for the next frame.
    PreRender,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],

    vram: [u8; 2048],
    palette_ram: [u8; 32],

    addr: u16,
    write_latch: bool,
    read_buffer: u8,

    scanline: u16,
    cycle: u16,
    frame_count: u64,

    frame_buffer: Vec<u32>,
    bg_opaque: Vec<bool>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            vram: [0; 2048],
            palette_ram: [0; 32],
            addr: 0,
            write_latch: false,
            read_buffer: 0,
            scanline: 0,
            cycle: 0,
            frame_count: 0,
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            bg_opaque: vec![false; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Row-major 256x240 packed `0xRRGGBB`. Only a complete frame after
    /// [`Checkpoint::FrameEnd`].
    pub fn frame_buffer(&self) -> &[u32] {
        &self.frame_buffer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn nmi_enabled(&self) -> bool {
        (self.ctrl & CTRL_NMI_ENABLE) != 0
    }

    pub fn scanline_cycle(&self) -> (u16, u16) {
        (self.scanline, self.cycle)
    }

    pub fn debug_ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn debug_mask(&self) -> u8 {
        self.mask
    }

    pub fn debug_status(&self) -> u8 {
        self.status
    }

    pub fn debug_vram_addr(&self) -> u16 {
        self.addr
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index & 0xFF]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[palette_index(0x3F00 + (index as u16 & 0x1F))]
    }

    fn nametable_base(&self) -> u16 {
        0x2000 + (self.ctrl & CTRL_NAMETABLE) as u16 * 0x400
    }

    fn vram_increment(&self) -> u16 {
        if (self.ctrl & CTRL_VRAM_INC_32) != 0 { 32 } else { 1 }
    }

    fn sprite_table(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_TABLE) != 0 { 0x1000 } else { 0 }
    }

    fn bg_table(&self) -> u16 {
        if (self.ctrl & CTRL_BG_TABLE) != 0 { 0x1000 } else { 0 }
    }

    fn show_bg(&self) -> bool {
        (self.mask & MASK_SHOW_BG) != 0
    }

    fn show_sprites(&self) -> bool {
        (self.mask & MASK_SHOW_SPRITES) != 0
    }

    /// Advances one PPU cycle. Checkpoints are evaluated at the position the
    /// counters hold on entry.
    pub fn step(&mut self, mapper: &mut dyn Mapper) -> Result<Option<Checkpoint>, CoreError> {
        let position = (self.scanline, self.cycle);
        let checkpoint = if position == FRAME_END {
            if self.show_bg() || self.show_sprites() {
                self.render_frame(mapper)?;
            }
            self.frame_count = self.frame_count.wrapping_add(1);
            Some(Checkpoint::FrameEnd)
        } else if position == VBLANK_START {
            self.status |= STATUS_VBLANK;
            Some(Checkpoint::VblankStart)
        } else if position == PRE_RENDER {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            Some(Checkpoint::PreRender)
        } else {
            None
        };
        if let Some(checkpoint) = checkpoint {
            trace!(?checkpoint, scanline = position.0, cycle = position.1, "ppu checkpoint");
        }

        self.cycle += 1;
        if self.cycle >= CYCLES_PER_SCANLINE {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline >= SCANLINES_PER_FRAME {
                self.scanline = 0;
            }
        }
        Ok(checkpoint)
    }

    /// `reg` is already folded into 0x2000..=0x2007.
    pub fn read_register(&mut self, reg: u16, mapper: &mut dyn Mapper) -> Result<u8, CoreError> {
        let value = match reg {
            0x2002 => {
                let value = self.status;
                self.status &= !STATUS_VBLANK;
                self.write_latch = false;
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let addr = self.addr & 0x3FFF;
                let value = if addr < 0x3F00 {
                    let buffered = self.read_buffer;
                    self.read_buffer = self.read(addr, mapper)?;
                    buffered
                } else {
                    self.read_buffer = self.read(addr - 0x1000, mapper)?;
                    self.read(addr, mapper)?
                };
                self.addr = self.addr.wrapping_add(self.vram_increment());
                value
            }
            _ => {
                trace!("read of write-only PPU register ${reg:04X}");
                0
            }
        };
        Ok(value)
    }

    /// Register value without the read side effects.
    pub fn peek_register(&self, reg: u16) -> u8 {
        match reg {
            0x2002 => self.status,
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => self.read_buffer,
            _ => 0,
        }
    }

    pub fn write_register(
        &mut self,
        reg: u16,
        value: u8,
        mapper: &mut dyn Mapper,
    ) -> Result<(), CoreError> {
        match reg {
            0x2000 => self.ctrl = value,
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2006 => {
                if !self.write_latch {
                    self.addr = (self.addr & 0x00FF) | ((value as u16) << 8);
                } else {
                    self.addr = (self.addr & 0xFF00) | value as u16;
                }
                self.write_latch = !self.write_latch;
            }
            0x2007 => {
                self.write(self.addr, value, mapper)?;
                self.addr = self.addr.wrapping_add(self.vram_increment());
            }
            // 0x2005 scroll and read-only 0x2002 are accepted and dropped.
            _ => {}
        }
        Ok(())
    }

    /// OAM DMA payload, stored from OAM index 0.
    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        self.oam.copy_from_slice(bytes);
    }

    fn read(&mut self, addr: u16, mapper: &mut dyn Mapper) -> Result<u8, CoreError> {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => Ok(mapper.ppu_read(addr)),
            0x2000..=0x3EFF => Ok(self.vram[nametable_index(addr, mapper.mirroring())]),
            0x3F00..=0x3FFF => Ok(self.palette_ram[palette_index(addr)]),
            _ => Err(CoreError::PpuAddressOutOfRange(addr)),
        }
    }

    fn write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => self.vram[nametable_index(addr, mapper.mirroring())] = value,
            0x3F00..=0x3FFF => self.palette_ram[palette_index(addr)] = value,
            _ => return Err(CoreError::PpuAddressOutOfRange(addr)),
        }
        Ok(())
    }

    fn render_frame(&mut self, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        if self.show_bg() {
            self.draw_background(mapper)?;
        } else {
            let backdrop = palette::color(self.palette_ram[0]);
            self.frame_buffer.fill(backdrop);
            self.bg_opaque.fill(false);
        }
        if self.show_sprites() {
            self.draw_sprites(mapper)?;
        }
        Ok(())
    }

    fn draw_background(&mut self, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        let nametable = self.nametable_base();
        let attribute_table = nametable + ATTRIBUTE_TABLE_OFFSET;
        let pattern_table = self.bg_table();
        let backdrop = self.palette_ram[0];

        for tile_y in 0..30u16 {
            for tile_x in 0..32u16 {
                let tile = self.read(nametable + tile_y * 32 + tile_x, mapper)? as u16;
                let attribute =
                    self.read(attribute_table + (tile_y / 4) * 8 + tile_x / 4, mapper)?;
                let palette_group = attribute_bits(attribute, tile_x, tile_y);

                for fine_y in 0..8u16 {
                    let row = pattern_table + tile * 16 + fine_y;
                    let low = self.read(row, mapper)?;
                    let high = self.read(row + 8, mapper)?;
                    for fine_x in 0..8u16 {
                        let shift = 7 - fine_x;
                        let pixel = ((low >> shift) & 1) | (((high >> shift) & 1) << 1);
                        let x = (tile_x * 8 + fine_x) as usize;
                        let y = (tile_y * 8 + fine_y) as usize;
                        let opaque = pixel != 0;
                        let color = if opaque {
                            self.palette_ram[(palette_group | pixel) as usize]
                        } else {
                            backdrop
                        };
                        let idx = y * FRAME_WIDTH + x;
                        self.frame_buffer[idx] = palette::color(color);
                        self.bg_opaque[idx] = opaque;
                    }
                }
            }
        }
        Ok(())
    }

    fn draw_sprites(&mut self, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        let pattern_table = self.sprite_table();
        let both_layers = self.show_bg() && self.show_sprites();
        let show_bg_left = (self.mask & MASK_SHOW_BG_LEFT) != 0;
        let show_sprite_left = (self.mask & MASK_SHOW_SPRITE_LEFT) != 0;

        // Lowest OAM index draws last so it ends up on top.
        for sprite in (0..64usize).rev() {
            let base = sprite * 4;
            let sprite_y = self.oam[base];
            if sprite_y == OFFSCREEN_SPRITE_Y {
                continue;
            }
            let tile = self.oam[base + 1] as u16;
            let attributes = self.oam[base + 2];
            let sprite_x = self.oam[base + 3] as usize;
            let palette_group = ((attributes & 0x03) << 2) as u16;

            for row in 0..8usize {
                let y = sprite_y as usize + row;
                if y >= FRAME_HEIGHT {
                    break;
                }
                let line = if (attributes & SPRITE_FLIP_Y) != 0 {
                    (7 - row) as u16
                } else {
                    row as u16
                };
                let low = self.read(pattern_table + tile * 16 + line, mapper)?;
                let high = self.read(pattern_table + tile * 16 + line + 8, mapper)?;

                for col in 0..8usize {
                    let x = sprite_x + col;
                    if x >= FRAME_WIDTH {
                        break;
                    }
                    let shift = if (attributes & SPRITE_FLIP_X) != 0 { col } else { 7 - col };
                    let pixel = ((low >> shift) & 1) | (((high >> shift) & 1) << 1);
                    if pixel == 0 {
                        continue;
                    }

                    let idx = y * FRAME_WIDTH + x;
                    let bg_opaque = self.bg_opaque[idx];
                    // Left-column mask bits only gate the hit flag.
                    let clipped = x < 8 && (!show_sprite_left || !show_bg_left);
                    if sprite == 0 && bg_opaque && both_layers && !clipped {
                        self.status |= STATUS_SPRITE_ZERO_HIT;
                    }
                    if (attributes & SPRITE_BEHIND_BG) != 0 && bg_opaque {
                        continue;
                    }
                    let color =
                        self.read(SPRITE_PALETTE_BASE + (palette_group | pixel as u16), mapper)?;
                    self.frame_buffer[idx] = palette::color(color);
                }
            }
        }
        Ok(())
    }
}

/// Folds a 0x2000..=0x3EFF address into the 2 KiB of nametable RAM.
fn nametable_index(addr: u16, mirroring: Mirroring) -> usize {
    let index = (addr - 0x2000) % 0x1000;
    let folded = match mirroring {
        Mirroring::Vertical => index % 0x800,
        Mirroring::Horizontal => match index {
            0x400..0xC00 => index - 0x400,
            0xC00.. => index - 0x800,
            _ => index,
        },
    };
    folded as usize
}

/// Entries 0x10/0x14/0x18/0x1C alias the background entries below them.
fn palette_index(addr: u16) -> usize {
    let mut index = (addr - 0x3F00) % 0x20;
    if index > 0x0F && index % 4 == 0 {
        index -= 0x10;
    }
    index as usize
}

/// Two palette-select bits of an attribute byte, already shifted into bits 2-3.
fn attribute_bits(attribute: u8, tile_x: u16, tile_y: u16) -> u8 {
    let quadrant = (tile_y & 0x02) | ((tile_x & 0x02) >> 1);
    match quadrant {
        0 => (attribute & 0x03) << 2,
        1 => attribute & 0x0C,
        2 => (attribute & 0x30) >> 2,
        _ => (attribute & 0xC0) >> 4,
    }
}
