//! Packed-integer (MMX) arithmetic and the MMX/x87 register overlay.
//!
//! The eight MMX registers alias the x87 data stack on real silicon. The
//! core keeps two renditions of that aliasing: in plain mode the MMX state
//! lives in a dedicated register file, while in softfloat mode every MMX
//! access is routed through the x87 slots' 64-bit fraction fields and a
//! packed write stamps the slot's sign/exponent word with the all-ones
//! sentinel, exactly as the hardware leaves it.

use serde::{Deserialize, Serialize};

use super::ea::Operand;
use super::{Cpu586, MemFault, Memory586};
use crate::logging::{log, LogCategory, LogLevel};

/// A 64-bit MMX register, addressed as 8x8, 4x16 or 2x32 lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmxReg(pub u64);

impl MmxReg {
    pub fn b(self, lane: usize) -> u8 {
        (self.0 >> (lane * 8)) as u8
    }

    pub fn set_b(&mut self, lane: usize, value: u8) {
        let shift = lane * 8;
        self.0 = (self.0 & !(0xFF << shift)) | ((value as u64) << shift);
    }

    pub fn w(self, lane: usize) -> u16 {
        (self.0 >> (lane * 16)) as u16
    }

    /// Signed view of a 16-bit lane.
    pub fn sw(self, lane: usize) -> i16 {
        self.w(lane) as i16
    }

    pub fn set_w(&mut self, lane: usize, value: u16) {
        let shift = lane * 16;
        self.0 = (self.0 & !(0xFFFF << shift)) | ((value as u64) << shift);
    }

    pub fn d(self, lane: usize) -> u32 {
        (self.0 >> (lane * 32)) as u32
    }

    pub fn set_d(&mut self, lane: usize, value: u32) {
        let shift = lane * 32;
        self.0 = (self.0 & !(0xFFFF_FFFF << shift)) | ((value as u64) << shift);
    }
}

/// One x87 data-stack slot in unpacked extended-precision form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpuSlot {
    /// Sign and biased exponent.
    pub sign_exp: u16,
    /// 64-bit significand; doubles as the MMX register body.
    pub fraction: u64,
}

/// Sign/exponent word left behind by a packed write. Reads back as a NaN
/// if the slot is later used as a float.
pub const PACKED_SIGN_EXP: u16 = 0xFFFF;

impl FpuSlot {
    /// Store a 64-bit packed value, stamping the NaN sentinel.
    pub fn write_packed(&mut self, value: u64) {
        self.fraction = value;
        self.sign_exp = PACKED_SIGN_EXP;
    }
}

/// The packed arithmetic operations of the 0F-prefixed MMX group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmxOp {
    Paddb,
    Paddw,
    Paddd,
    Paddsb,
    Paddsw,
    Paddusb,
    Paddusw,
    Psubb,
    Psubw,
    Psubd,
    Psubsb,
    Psubsw,
    Psubusb,
    Psubusw,
    Pmullw,
    Pmulhw,
    Pmaddwd,
}

/// Apply a packed operation to two 64-bit values. Pure; lane carries never
/// cross lane boundaries.
pub fn combine(op: MmxOp, dst: MmxReg, src: MmxReg) -> MmxReg {
    let mut out = MmxReg::default();
    match op {
        MmxOp::Paddb => {
            for i in 0..8 {
                out.set_b(i, dst.b(i).wrapping_add(src.b(i)));
            }
        }
        MmxOp::Psubb => {
            for i in 0..8 {
                out.set_b(i, dst.b(i).wrapping_sub(src.b(i)));
            }
        }
        MmxOp::Paddw => {
            for i in 0..4 {
                out.set_w(i, dst.w(i).wrapping_add(src.w(i)));
            }
        }
        MmxOp::Psubw => {
            for i in 0..4 {
                out.set_w(i, dst.w(i).wrapping_sub(src.w(i)));
            }
        }
        MmxOp::Paddd => {
            for i in 0..2 {
                out.set_d(i, dst.d(i).wrapping_add(src.d(i)));
            }
        }
        MmxOp::Psubd => {
            for i in 0..2 {
                out.set_d(i, dst.d(i).wrapping_sub(src.d(i)));
            }
        }
        MmxOp::Paddsb => {
            for i in 0..8 {
                out.set_b(i, (dst.b(i) as i8).saturating_add(src.b(i) as i8) as u8);
            }
        }
        MmxOp::Psubsb => {
            for i in 0..8 {
                out.set_b(i, (dst.b(i) as i8).saturating_sub(src.b(i) as i8) as u8);
            }
        }
        MmxOp::Paddsw => {
            for i in 0..4 {
                out.set_w(i, dst.sw(i).saturating_add(src.sw(i)) as u16);
            }
        }
        MmxOp::Psubsw => {
            for i in 0..4 {
                out.set_w(i, dst.sw(i).saturating_sub(src.sw(i)) as u16);
            }
        }
        MmxOp::Paddusb => {
            for i in 0..8 {
                out.set_b(i, dst.b(i).saturating_add(src.b(i)));
            }
        }
        MmxOp::Psubusb => {
            for i in 0..8 {
                out.set_b(i, dst.b(i).saturating_sub(src.b(i)));
            }
        }
        MmxOp::Paddusw => {
            for i in 0..4 {
                out.set_w(i, dst.w(i).saturating_add(src.w(i)));
            }
        }
        MmxOp::Psubusw => {
            for i in 0..4 {
                out.set_w(i, dst.w(i).saturating_sub(src.w(i)));
            }
        }
        MmxOp::Pmullw => {
            for i in 0..4 {
                out.set_w(i, (dst.sw(i) as i32).wrapping_mul(src.sw(i) as i32) as u16);
            }
        }
        MmxOp::Pmulhw => {
            for i in 0..4 {
                out.set_w(i, (((dst.sw(i) as i32) * (src.sw(i) as i32)) >> 16) as u16);
            }
        }
        MmxOp::Pmaddwd => {
            for i in 0..2 {
                // Both products being -32768 * -32768 would overflow the
                // 32-bit sum; the hardware pins that one case.
                if dst.d(i) == 0x8000_8000 && src.d(i) == 0x8000_8000 {
                    out.set_d(i, 0x8000_0000);
                } else {
                    let lo = (dst.sw(i * 2) as i32) * (src.sw(i * 2) as i32);
                    let hi = (dst.sw(i * 2 + 1) as i32) * (src.sw(i * 2 + 1) as i32);
                    out.set_d(i, lo.wrapping_add(hi) as u32);
                }
            }
        }
    }
    out
}

impl<M: Memory586> Cpu586<M> {
    /// Read MMX register `i` through whichever register file is active.
    pub fn mmx_reg(&self, i: u8) -> MmxReg {
        if self.softfloat {
            MmxReg(self.fpu[i as usize].fraction)
        } else {
            self.mm[i as usize]
        }
    }

    /// Write MMX register `i`. In softfloat mode this goes through the x87
    /// slot and leaves the NaN sentinel in its sign/exponent word.
    pub fn set_mmx_reg(&mut self, i: u8, value: MmxReg) {
        if self.softfloat {
            self.fpu[i as usize].write_packed(value.0);
        } else {
            self.mm[i as usize] = value;
        }
    }

    /// Side effects every MMX instruction performs on the x87 state before
    /// touching operands: the stack top resets and all tags read as valid.
    pub fn mmx_enter(&mut self) {
        if self.fpu_top != 0 || self.fpu_tag != 0 {
            log(LogCategory::Fpu, LogLevel::Debug, || {
                format!(
                    "mmx_enter: clearing top={} tag={:04X}",
                    self.fpu_top, self.fpu_tag
                )
            });
        }
        self.fpu_top = 0;
        self.fpu_tag = 0;
    }

    /// Execute one two-operand packed instruction. The destination is the
    /// MMX register in the ModR/M `reg` field; the source is a register or
    /// a 64-bit memory operand.
    pub(crate) fn exec_mmx(&mut self, op: MmxOp) -> Result<(), MemFault> {
        self.mmx_enter();
        let ea = self.fetch_ea()?;
        let src = match ea.operand {
            Operand::Reg(r) => self.mmx_reg(r),
            Operand::Mem { seg, offset } => {
                // Both halves are read before any register changes, so a
                // fault on either leaves the destination untouched.
                let lo = self.read_u32(seg, offset)?;
                let hi = self.read_u32(seg, offset.wrapping_add(4))?;
                MmxReg(((hi as u64) << 32) | lo as u64)
            }
        };
        let res = combine(op, self.mmx_reg(ea.reg), src);
        self.set_mmx_reg(ea.reg, res);
        self.timing.charge_mmx(ea.operand.is_reg());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_586::{ArrayMemory, CpuModel, ExecStatus, SegReg};

    fn cpu_with_code(code: &[u8]) -> Cpu586<ArrayMemory> {
        let mut mem = ArrayMemory::new(0x20000);
        mem.load_program(0x1000, code);
        let mut cpu = Cpu586::new(mem, CpuModel::PentiumMmx);
        cpu.reset_at(0x100, 0);
        cpu
    }

    fn splat_w(value: u16) -> MmxReg {
        let mut r = MmxReg::default();
        for i in 0..4 {
            r.set_w(i, value);
        }
        r
    }

    #[test]
    fn paddb_wraps_per_lane() {
        let a = MmxReg(0xFF01_7F80_0010_2030);
        let b = MmxReg(0x0102_0101_0001_0101);
        let r = combine(MmxOp::Paddb, a, b);
        assert_eq!(r.0, 0x0003_8081_0011_2131);
    }

    #[test]
    fn signed_saturation_pins_at_the_rails() {
        let r = combine(MmxOp::Paddsb, MmxReg(0x7F80_0000_0000_007F), MmxReg(0x01FF_0000_0000_0001));
        assert_eq!(r.b(7), 0x7F); // 127 + 1 pins at 127
        assert_eq!(r.b(6), 0x80); // -128 + -1 pins at -128
        assert_eq!(r.b(0), 0x7F); // 127 + 1 again, low lane

        let r = combine(MmxOp::Psubsw, splat_w(0x8000), splat_w(0x0001));
        assert_eq!(r.w(0), 0x8000); // -32768 - 1 pins
    }

    #[test]
    fn unsigned_saturation_pins_at_zero_and_max() {
        let r = combine(MmxOp::Psubusb, MmxReg(0x0000_0000_0000_0005), MmxReg(0x0000_0000_0000_0009));
        assert_eq!(r.0, 0); // 5 - 9 pins at 0

        let r = combine(MmxOp::Paddusw, splat_w(0xFFF0), splat_w(0x0100));
        assert_eq!(r.w(2), 0xFFFF);
    }

    #[test]
    fn pmullw_and_pmulhw_split_the_product() {
        let a = splat_w(0x1234);
        let b = splat_w(0xFFFE); // -2
        let lo = combine(MmxOp::Pmullw, a, b);
        let hi = combine(MmxOp::Pmulhw, a, b);
        // 0x1234 * -2 = -0x2468 = 0xFFFF_DB98 as i32.
        assert_eq!(lo.w(0), 0xDB98);
        assert_eq!(hi.w(0), 0xFFFF);
    }

    #[test]
    fn pmaddwd_sums_adjacent_products() {
        let mut a = MmxReg::default();
        a.set_w(0, 3);
        a.set_w(1, 0xFFFF); // -1
        let mut b = MmxReg::default();
        b.set_w(0, 100);
        b.set_w(1, 7);
        let r = combine(MmxOp::Pmaddwd, a, b);
        assert_eq!(r.d(0) as i32, 3 * 100 - 7);
    }

    #[test]
    fn pmaddwd_pins_the_double_minimum_case() {
        let r = combine(MmxOp::Pmaddwd, splat_w(0x8000), splat_w(0x8000));
        // Without the pin this would wrap to 0.
        assert_eq!(r.d(0), 0x8000_0000);
        assert_eq!(r.d(1), 0x8000_0000);
    }

    #[test]
    fn paddusb_through_the_interpreter() {
        // PADDUSB MM0, MM1
        let mut cpu = cpu_with_code(&[0x0F, 0xDC, 0xC1]);
        cpu.mm[0] = MmxReg(0xFAFA_FAFA_FAFA_FAFA); // [250; 8]
        cpu.mm[1] = MmxReg(0x0A0A_0A0A_0A0A_0A0A); // [10; 8]
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.mm[0].0, u64::MAX);
        assert_eq!(cpu.timing.cycles(), 1);
    }

    #[test]
    fn memory_source_reads_both_halves() {
        // PADDD MM2, [BX]
        let mut cpu = cpu_with_code(&[0x0F, 0xFE, 0x17]);
        cpu.gpr[3] = 0x4000;
        cpu.write_u32(SegReg::Ds, 0x4000, 0x0000_0001).unwrap();
        cpu.write_u32(SegReg::Ds, 0x4004, 0xFFFF_FFFF).unwrap();
        cpu.mm[2] = MmxReg(0x0000_0001_0000_0002);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.mm[2].0, 0x0000_0000_0000_0003);
        assert_eq!(cpu.timing.cycles(), 2);
    }

    #[test]
    fn faulting_source_leaves_destination_unmodified() {
        // PADDB MM0, [BX] with the high half of the quadword unmapped.
        let mut cpu = cpu_with_code(&[0x0F, 0xFC, 0x07]);
        cpu.segments_mut()[SegReg::Ds as usize] = 0x1FFF;
        cpu.gpr[3] = 0x000C; // phys 0x1FFFC: low half maps, high half does not
        cpu.mm[0] = MmxReg(0x1122_3344_5566_7788);
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert_eq!(cpu.mm[0].0, 0x1122_3344_5566_7788);
        assert!(cpu.last_fault().is_some());
    }

    #[test]
    fn mmx_resets_the_x87_stack_state() {
        let mut cpu = cpu_with_code(&[0x0F, 0xFC, 0xC1]); // PADDB MM0, MM1
        cpu.fpu_top = 5;
        cpu.fpu_tag = 0xFFFF;
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.fpu_top, 0);
        assert_eq!(cpu.fpu_tag, 0);
    }

    #[test]
    fn softfloat_mode_stamps_the_nan_sentinel() {
        let mut cpu = cpu_with_code(&[0x0F, 0xFC, 0xC1]); // PADDB MM0, MM1
        cpu.set_softfloat(true);
        cpu.fpu[0].fraction = 5;
        cpu.fpu[0].sign_exp = 0x4005;
        cpu.fpu[1].fraction = 7;
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.fpu[0].fraction, 12);
        assert_eq!(cpu.fpu[0].sign_exp, PACKED_SIGN_EXP);
    }

    #[test]
    fn softfloat_switch_carries_register_contents() {
        let mut cpu = cpu_with_code(&[]);
        cpu.mm[3] = MmxReg(0xDEAD_BEEF_0123_4567);
        cpu.set_softfloat(true);
        assert_eq!(cpu.mmx_reg(3).0, 0xDEAD_BEEF_0123_4567);
        cpu.set_mmx_reg(3, MmxReg(0x55));
        cpu.set_softfloat(false);
        assert_eq!(cpu.mm[3].0, 0x55);
    }
}
