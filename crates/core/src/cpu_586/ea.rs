//! ModR/M decoding and effective-address resolution.
//!
//! [`Cpu586::fetch_ea`] consumes the ModR/M byte (plus any SIB byte and
//! displacement) from the instruction stream and produces an [`EffAddr`]:
//! the register selector from the `reg` field and an [`Operand`] naming
//! either a register or a segment-relative memory location. Resolution
//! itself never touches data memory, so a handler can resolve the address
//! first and let the actual operand access be the fault point.

use super::{Cpu586, MemFault, Memory586, SegReg, Width};

/// Address-size attribute of the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSize {
    A16,
    A32,
}

/// A decoded operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register file index (meaning depends on the operand width).
    Reg(u8),
    /// Memory location, kept as segment + offset so the access layer can
    /// form the physical address at touch time.
    Mem { seg: SegReg, offset: u32 },
}

impl Operand {
    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(_))
    }
}

/// Result of decoding a ModR/M byte.
#[derive(Debug, Clone, Copy)]
pub struct EffAddr {
    /// The `reg` field (register selector or opcode extension).
    pub reg: u8,
    pub operand: Operand,
}

// Register indices in ModR/M encoding order.
const BX: usize = 3;
const SP: usize = 4;
const BP: usize = 5;
const SI: usize = 6;
const DI: usize = 7;

impl<M: Memory586> Cpu586<M> {
    /// Segment for a memory operand: any prefix override wins, otherwise
    /// the addressing-mode default. The override is consumed here.
    fn ea_segment(&mut self, default: SegReg) -> SegReg {
        self.segment_override.take().unwrap_or(default)
    }

    /// Decode the ModR/M byte (and SIB/displacement) at the current
    /// instruction pointer.
    pub fn fetch_ea(&mut self) -> Result<EffAddr, MemFault> {
        let modrm = self.fetch_u8()?;
        let md = modrm >> 6;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;

        if md == 3 {
            return Ok(EffAddr {
                reg,
                operand: Operand::Reg(rm),
            });
        }

        let operand = match self.addr_size {
            AddrSize::A16 => self.fetch_ea_16(md, rm)?,
            AddrSize::A32 => self.fetch_ea_32(md, rm)?,
        };
        Ok(EffAddr { reg, operand })
    }

    fn fetch_ea_16(&mut self, md: u8, rm: u8) -> Result<Operand, MemFault> {
        let base = match rm {
            0 => (self.gpr[BX] as u16).wrapping_add(self.gpr[SI] as u16),
            1 => (self.gpr[BX] as u16).wrapping_add(self.gpr[DI] as u16),
            2 => (self.gpr[BP] as u16).wrapping_add(self.gpr[SI] as u16),
            3 => (self.gpr[BP] as u16).wrapping_add(self.gpr[DI] as u16),
            4 => self.gpr[SI] as u16,
            5 => self.gpr[DI] as u16,
            6 => self.gpr[BP] as u16,
            _ => self.gpr[BX] as u16,
        };

        // mod=00 rm=110 is a bare disp16, not BP-relative.
        let (base, disp) = match (md, rm) {
            (0, 6) => (0u16, self.fetch_u16()?),
            (0, _) => (base, 0),
            (1, _) => (base, self.fetch_u8()? as i8 as u16),
            _ => (base, self.fetch_u16()?),
        };

        // BP-based modes default to the stack segment.
        let default = match rm {
            2 | 3 => SegReg::Ss,
            6 if md != 0 => SegReg::Ss,
            _ => SegReg::Ds,
        };

        Ok(Operand::Mem {
            seg: self.ea_segment(default),
            offset: base.wrapping_add(disp) as u32,
        })
    }

    fn fetch_ea_32(&mut self, md: u8, rm: u8) -> Result<Operand, MemFault> {
        let (base, default) = match rm {
            4 => return self.fetch_ea_sib(md),
            5 if md == 0 => (0, SegReg::Ds),
            5 => (self.gpr[BP], SegReg::Ss),
            _ => (self.gpr[rm as usize], SegReg::Ds),
        };

        let disp = match (md, rm) {
            (0, 5) => self.fetch_u32()?,
            (0, _) => 0,
            (1, _) => self.fetch_u8()? as i8 as u32,
            _ => self.fetch_u32()?,
        };

        Ok(Operand::Mem {
            seg: self.ea_segment(default),
            offset: base.wrapping_add(disp),
        })
    }

    fn fetch_ea_sib(&mut self, md: u8) -> Result<Operand, MemFault> {
        let sib = self.fetch_u8()?;
        let scale = sib >> 6;
        let index = ((sib >> 3) & 7) as usize;
        let base_sel = (sib & 7) as usize;

        let (base, default) = match base_sel {
            // base=101 with mod=00 means disp32, no base register.
            BP if md == 0 => (0, SegReg::Ds),
            BP => (self.gpr[BP], SegReg::Ss),
            SP => (self.gpr[SP], SegReg::Ss),
            _ => (self.gpr[base_sel], SegReg::Ds),
        };

        // index=100 encodes "no index".
        let scaled = if index == SP {
            0
        } else {
            self.gpr[index] << scale
        };

        let disp = match md {
            0 if base_sel == BP => self.fetch_u32()?,
            0 => 0,
            1 => self.fetch_u8()? as i8 as u32,
            _ => self.fetch_u32()?,
        };

        Ok(Operand::Mem {
            seg: self.ea_segment(default),
            offset: base.wrapping_add(scaled).wrapping_add(disp),
        })
    }

    /// Read an operand of the given width.
    pub fn read_operand(&mut self, width: Width, operand: Operand) -> Result<u32, MemFault> {
        match operand {
            Operand::Reg(r) => Ok(match width {
                Width::Byte => self.reg8(r) as u32,
                Width::Word => self.reg16(r) as u32,
                Width::Dword => self.gpr[r as usize],
            }),
            Operand::Mem { seg, offset } => match width {
                Width::Byte => self.read_u8(seg, offset).map(u32::from),
                Width::Word => self.read_u16(seg, offset).map(u32::from),
                Width::Dword => self.read_u32(seg, offset),
            },
        }
    }

    /// Write an operand of the given width. Values wider than `width` are
    /// truncated.
    pub fn write_operand(
        &mut self,
        width: Width,
        operand: Operand,
        value: u32,
    ) -> Result<(), MemFault> {
        match operand {
            Operand::Reg(r) => {
                match width {
                    Width::Byte => self.set_reg8(r, value as u8),
                    Width::Word => self.set_reg16(r, value as u16),
                    Width::Dword => self.gpr[r as usize] = value,
                }
                Ok(())
            }
            Operand::Mem { seg, offset } => match width {
                Width::Byte => self.write_u8(seg, offset, value as u8),
                Width::Word => self.write_u16(seg, offset, value as u16),
                Width::Dword => self.write_u32(seg, offset, value),
            },
        }
    }
}
