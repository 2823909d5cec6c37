//! The group-2 shift/rotate family (C0/C1, D0-D3) and the two-operand
//! double shifts (0F A4/A5/AC/AD).
//!
//! Handler sequence for the group-2 forms: decode the operand, take the
//! count (masked to 5 bits), and read the operand — the read happens even
//! for a zero count, so a bad memory operand always faults. A zero count
//! then bails out with no write-back, no flag change and no execution
//! charge. Otherwise compute, write back, and only then update flags, so
//! an aborted write-back leaves the flags exactly as they were. Plain
//! shifts leave a deferred flag record; rotates need concrete flags (they
//! only own CF and OF) and therefore force a rebuild first.

use super::ea::Operand;
use super::flags::{sign_extend, PendingOp, Width};
use super::{Cpu586, MemFault, Memory586};

/// Where the shift count of a group-2 opcode comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountSource {
    /// D0/D1: implicit count of one.
    One,
    /// C0/C1: immediate byte following the ModR/M block.
    Imm,
    /// D2/D3: the CL register.
    Cl,
}

fn rotl(value: u32, amount: u32, width: Width) -> u32 {
    let bits = width.bits();
    let amount = amount % bits;
    if amount == 0 {
        value & width.mask()
    } else {
        ((value << amount) | ((value & width.mask()) >> (bits - amount))) & width.mask()
    }
}

fn rotr(value: u32, amount: u32, width: Width) -> u32 {
    let bits = width.bits();
    let amount = amount % bits;
    if amount == 0 {
        value & width.mask()
    } else {
        (((value & width.mask()) >> amount) | (value << (bits - amount))) & width.mask()
    }
}

impl<M: Memory586> Cpu586<M> {
    /// Execute one group-2 opcode (ROL/ROR/RCL/RCR/SHL/SHR/SAR) selected by
    /// the ModR/M `reg` field.
    pub(crate) fn exec_shift_group(
        &mut self,
        width: Width,
        source: CountSource,
    ) -> Result<(), MemFault> {
        let ea = self.fetch_ea()?;
        let count = match source {
            CountSource::One => 1,
            CountSource::Imm => self.fetch_u8()? as u32,
            CountSource::Cl => self.reg8(1) as u32,
        } & 0x1F;

        // The operand is read unconditionally, so a bad address faults
        // even when the count turns out to be zero.
        let val = self.read_operand(width, ea.operand)?;

        // Zero count: nothing happens. No write-back, no flag change, no
        // execution charge, and a pending flag record stays pending.
        if count == 0 {
            return Ok(());
        }

        // Rotates read CF and every form may overwrite stale bits, so the
        // deferred record must be folded in before the operation runs.
        self.flags.rebuild();

        match ea.reg {
            2 | 3 => self.rotate_carry(width, ea.operand, val, count, ea.reg == 2),
            _ => self.shift_rotate(width, ea.operand, val, count, ea.reg),
        }
    }

    fn shift_rotate(
        &mut self,
        width: Width,
        operand: Operand,
        val: u32,
        count: u32,
        op: u8,
    ) -> Result<(), MemFault> {
        let mask = width.mask();
        let sign = width.sign_bit();
        let bits = width.bits();

        match op {
            0 => {
                // ROL
                let res = rotl(val, count, width);
                self.write_operand(width, operand, res)?;
                self.flags.set_carry(res & 1 != 0);
                self.flags
                    .set_overflow((res ^ (res >> (bits - 1))) & 1 != 0);
            }
            1 => {
                // ROR
                let res = rotr(val, count, width);
                self.write_operand(width, operand, res)?;
                self.flags.set_carry(res & sign != 0);
                self.flags
                    .set_overflow((res ^ (res >> 1)) & (sign >> 1) != 0);
            }
            5 => {
                // SHR
                let res = (val & mask) >> count;
                self.write_operand(width, operand, res)?;
                self.flags.set_shift(PendingOp::Shr, width, val, count, res);
            }
            7 => {
                // SAR
                let res = (sign_extend(val, width) as i32 >> count) as u32 & mask;
                self.write_operand(width, operand, res)?;
                self.flags.set_shift(PendingOp::Sar, width, val, count, res);
            }
            _ => {
                // SHL (reg=6 is the undocumented SAL alias)
                let res = (val << count) & mask;
                self.write_operand(width, operand, res)?;
                self.flags.set_shift(PendingOp::Shl, width, val, count, res);
            }
        }
        self.timing.charge_shift(operand.is_reg());
        Ok(())
    }

    /// RCL/RCR: a rotate through a (width+1)-bit value formed by the
    /// operand plus CF, executed bit by bit.
    fn rotate_carry(
        &mut self,
        width: Width,
        operand: Operand,
        val: u32,
        count: u32,
        left: bool,
    ) -> Result<(), MemFault> {
        let mask = width.mask();
        let sign = width.sign_bit();
        let bits = width.bits();

        // Barrel cores pay the count-proportional warm-up once the operand
        // is in hand; it is not refunded if the write-back later faults.
        self.timing.charge_rotate_carry_setup(count);

        let mut val = val & mask;
        let mut carry = self.flags.carry();
        for _ in 0..count {
            if left {
                let out = val & sign != 0;
                val = ((val << 1) | carry as u32) & mask;
                carry = out;
            } else {
                let out = val & 1 != 0;
                val = (val >> 1) | ((carry as u32) << (bits - 1));
                carry = out;
            }
            self.timing.charge_rcl_bit();
        }
        self.write_operand(width, operand, val)?;

        self.flags.set_carry(carry);
        if left {
            // OF = CF xor the new sign bit.
            self.flags.set_overflow(carry != (val & sign != 0));
        } else {
            // OF = top two result bits differ.
            self.flags
                .set_overflow((val ^ (val << 1)) & sign != 0);
        }
        self.timing.charge_rotate_carry(operand.is_reg());
        Ok(())
    }

    /// SHLD/SHRD: shift bits from a source register into the destination.
    ///
    /// A zero count writes nothing and changes no flags, but the fixed
    /// execution cost is still charged.
    pub(crate) fn exec_double_shift(
        &mut self,
        width: Width,
        left: bool,
        imm_count: bool,
    ) -> Result<(), MemFault> {
        let ea = self.fetch_ea()?;
        let count = if imm_count {
            self.fetch_u8()? as u32
        } else {
            self.reg8(1) as u32
        } & 0x1F;

        let src = match width {
            Width::Word => self.reg16(ea.reg) as u32,
            _ => self.gpr[ea.reg as usize],
        };
        let dst = self.read_operand(width, ea.operand)?;

        // The fixed cost lands after a successful read, zero count or not.
        self.timing.charge_double_shift();
        if count == 0 {
            return Ok(());
        }

        let (res, carry_out) = match (width, left) {
            (Width::Word, true) => {
                let carry = (dst << (count - 1)) & 0x8000 != 0;
                let templ = (dst << 16) | src;
                let res = if count <= 16 {
                    templ >> (16 - count)
                } else {
                    (templ << count) >> 16
                };
                (res & 0xFFFF, carry)
            }
            (Width::Word, false) => {
                let carry = (dst >> (count - 1)) & 1 != 0;
                let templ = dst | (src << 16);
                ((templ >> count) & 0xFFFF, carry)
            }
            (_, true) => {
                let carry = (dst >> (32 - count)) & 1 != 0;
                ((dst << count) | (src >> (32 - count)), carry)
            }
            (_, false) => {
                let carry = (dst >> (count - 1)) & 1 != 0;
                ((dst >> count) | (src << (32 - count)), carry)
            }
        };

        self.write_operand(width, ea.operand, res)?;
        self.flags.set_znp(width, res);
        self.flags.rebuild();
        self.flags.set_carry(carry_out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{rotl, rotr};
    use crate::cpu_586::{
        ArrayMemory, Cpu586, CpuModel, ExecStatus, MemFault, Memory586, SegReg, Width,
    };

    /// RAM with a write-protected tail, for exercising write-back faults.
    struct RomTailMemory {
        ram: ArrayMemory,
        rom_base: u32,
    }

    impl Memory586 for RomTailMemory {
        fn read_u8(&mut self, addr: u32) -> Result<u8, MemFault> {
            self.ram.read_u8(addr)
        }

        fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemFault> {
            if addr >= self.rom_base {
                return Err(MemFault::Write { addr });
            }
            self.ram.write_u8(addr, value)
        }
    }

    fn cpu_with_code(code: &[u8]) -> Cpu586<ArrayMemory> {
        let mut mem = ArrayMemory::new(0x20000);
        mem.load_program(0x1000, code);
        let mut cpu = Cpu586::new(mem, CpuModel::PentiumMmx);
        cpu.reset_at(0x100, 0); // CS:IP = 0100:0000 -> physical 0x1000
        cpu
    }

    #[test]
    fn rotations_round_trip_for_all_widths_and_counts() {
        for width in [Width::Byte, Width::Word, Width::Dword] {
            let bits = width.bits();
            let x = 0x9ABC_DEF1 & width.mask();
            for c in 0..32 {
                assert_eq!(rotr(rotl(x, c, width), c, width), x);
                // A left rotation is the complementary right rotation.
                assert_eq!(rotl(x, c, width), rotr(x, (bits - c % bits) % bits, width));
            }
        }
    }

    #[test]
    fn rol_byte_by_immediate() {
        // ROL AL, 3
        let mut cpu = cpu_with_code(&[0xC0, 0xC0, 0x03]);
        cpu.set_reg8(0, 0xB0);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x85);
        assert!(cpu.flags.carry());
        assert!(!cpu.flags.overflow());
        assert_eq!(cpu.timing.cycles(), 3);
        assert_eq!(cpu.timing.fetch_cycles(), 3);
    }

    #[test]
    fn ror_inverts_rol() {
        // ROL AL, 5 ; ROR AL, 5
        let mut cpu = cpu_with_code(&[0xC0, 0xC0, 0x05, 0xC0, 0xC8, 0x05]);
        cpu.set_reg8(0, 0x6B);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_ne!(cpu.reg8(0), 0x6B);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x6B);
    }

    #[test]
    fn zero_count_is_a_complete_no_op() {
        // ROL AL, 0 with a pending flag record and a pre-set carry.
        let mut cpu = cpu_with_code(&[0xC0, 0xC0, 0x20]);
        cpu.set_reg8(0, 0xFF);
        cpu.flags.load(0x0001);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0xFF);
        assert!(cpu.flags.carry());
        // Fetch bytes are still accounted, execution is not.
        assert_eq!(cpu.timing.cycles(), 0);
        assert_eq!(cpu.timing.fetch_cycles(), 3);
    }

    #[test]
    fn count_is_masked_to_five_bits() {
        // SHL AL, 0x21 behaves as SHL AL, 1.
        let mut cpu = cpu_with_code(&[0xC0, 0xE0, 0x21]);
        cpu.set_reg8(0, 0x41);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x82);
    }

    #[test]
    fn shl_sets_carry_and_overflow_lazily() {
        // SHL AL, 1 with AL = 0xC0: carry out 1, sign unchanged.
        let mut cpu = cpu_with_code(&[0xD0, 0xE0]);
        cpu.set_reg8(0, 0xC0);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x80);
        assert!(cpu.flags.is_owed());
        cpu.flags.rebuild();
        assert!(cpu.flags.carry());
        assert!(!cpu.flags.overflow());
        assert!(cpu.flags.sign());
    }

    #[test]
    fn shr_by_cl() {
        // SHR AX, CL with CL = 4.
        let mut cpu = cpu_with_code(&[0xD3, 0xE8]);
        cpu.set_reg16(0, 0x8012);
        cpu.set_reg8(1, 4);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg16(0), 0x0801);
        cpu.flags.rebuild();
        assert!(!cpu.flags.carry());
        assert!(!cpu.flags.zero());
    }

    #[test]
    fn sar_replicates_the_sign_bit() {
        // SAR AL, 2 with AL = 0x85.
        let mut cpu = cpu_with_code(&[0xC0, 0xF8, 0x02]);
        cpu.set_reg8(0, 0x85);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0xE1);
        cpu.flags.rebuild();
        // Last bit shifted out was bit 1 of 0x85.
        assert!(!cpu.flags.carry());
        assert!(cpu.flags.sign());
        assert!(!cpu.flags.overflow());
    }

    #[test]
    fn operand_size_prefix_selects_dword() {
        // 66 C1 E0 08 -> SHL EAX, 8
        let mut cpu = cpu_with_code(&[0x66, 0xC1, 0xE0, 0x08]);
        cpu.gpr[0] = 0x00AB_CDEF;
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.gpr[0], 0xABCD_EF00);
    }

    #[test]
    fn rcl_pulls_carry_into_bit_zero() {
        // RCL AL, 1 with AL = 0x80 and CF = 1.
        let mut cpu = cpu_with_code(&[0xD0, 0xD0]);
        cpu.set_reg8(0, 0x80);
        cpu.flags.load(0x0001);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x01);
        assert!(cpu.flags.carry());
        assert!(cpu.flags.overflow());
        // Barrel model: 1 warm-up + 9 register cycles.
        assert_eq!(cpu.timing.cycles(), 10);
    }

    #[test]
    fn rcr_round_trips_through_nine_bits() {
        // RCR AL, 9 returns a byte to its start (9-bit rotate, full turn).
        let mut cpu = cpu_with_code(&[0xC0, 0xD8, 0x09]);
        cpu.set_reg8(0, 0x5A);
        cpu.flags.load(0x0001);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg8(0), 0x5A);
        assert!(cpu.flags.carry());
    }

    #[test]
    fn serial_model_charges_per_rotated_bit() {
        let mut mem = ArrayMemory::new(0x20000);
        mem.load_program(0x1000, &[0xC0, 0xD0, 0x03]); // RCL AL, 3
        let mut cpu = Cpu586::new(mem, CpuModel::Intel80386);
        cpu.reset_at(0x100, 0);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.timing.cycles(), 12);
    }

    #[test]
    fn shift_to_memory_operand() {
        // SHL byte [BX], 1
        let mut cpu = cpu_with_code(&[0xD0, 0x27]);
        cpu.gpr[3] = 0x2000;
        cpu.write_u8(SegReg::Ds, 0x2000, 0x41).unwrap();
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.read_u8(SegReg::Ds, 0x2000).unwrap(), 0x82);
        assert_eq!(cpu.timing.cycles(), 7);
    }

    #[test]
    fn faulting_operand_aborts_without_flag_change() {
        // SHL byte [BX], 1 with BX pointing past the end of memory.
        let mut cpu = cpu_with_code(&[0xD0, 0x27]);
        cpu.gpr[3] = 0xFFFF;
        cpu.segments_mut()[SegReg::Ds as usize] = 0xF000;
        cpu.flags.load(0x0001);
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert!(cpu.last_fault().is_some());
        assert!(cpu.flags.carry());
        assert_eq!(cpu.instructions(), 0);
    }

    #[test]
    fn zero_count_shift_still_faults_on_a_bad_operand() {
        // SHL byte [BX], 0 with BX pointing past the end of memory: the
        // operand read happens before the count is considered.
        let mut cpu = cpu_with_code(&[0xC0, 0x27, 0x00]);
        cpu.gpr[3] = 0xFFFF;
        cpu.segments_mut()[SegReg::Ds as usize] = 0xF000;
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert!(cpu.last_fault().is_some());
        assert_eq!(cpu.instructions(), 0);
    }

    #[test]
    fn zero_count_keeps_a_pending_flag_record_pending() {
        // SHL AL, 1 leaves an owed record; ROL AL, 0 must not fold it in.
        let mut cpu = cpu_with_code(&[0xD0, 0xE0, 0xC0, 0xC0, 0x00]);
        cpu.set_reg8(0, 0xC0);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert!(cpu.flags.is_owed());
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert!(cpu.flags.is_owed());
    }

    #[test]
    fn rotate_read_fault_charges_nothing() {
        // RCL byte [BX], 4 against unmapped memory: the warm-up is only
        // charged once the operand read has succeeded.
        let mut cpu = cpu_with_code(&[0xC0, 0x17, 0x04]);
        cpu.gpr[3] = 0xFFFF;
        cpu.segments_mut()[SegReg::Ds as usize] = 0xF000;
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert_eq!(cpu.timing.cycles(), 0);
    }

    #[test]
    fn barrel_warmup_survives_an_aborted_write_back() {
        // RCL byte [BX], 4 against a read-only operand: the read succeeds,
        // the write-back faults, and the warm-up cycles stand.
        let mut ram = ArrayMemory::new(0x20000);
        ram.load_program(0x1000, &[0xC0, 0x17, 0x04]);
        ram.load_program(0x8000, &[0x5A]);
        let mem = RomTailMemory {
            ram,
            rom_base: 0x8000,
        };
        let mut cpu = Cpu586::new(mem, CpuModel::PentiumMmx);
        cpu.reset_at(0x100, 0);
        cpu.gpr[3] = 0x8000;
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert_eq!(cpu.last_fault(), Some(MemFault::Write { addr: 0x8000 }));
        // The 4 warm-up cycles stand; the completion cost was never paid.
        assert_eq!(cpu.timing.cycles(), 4);
    }

    #[test]
    fn double_shift_read_fault_charges_nothing() {
        // SHLD word [BX], AX, 4 against unmapped memory.
        let mut cpu = cpu_with_code(&[0x0F, 0xA4, 0x07, 0x04]);
        cpu.gpr[3] = 0xFFFF;
        cpu.segments_mut()[SegReg::Ds as usize] = 0xF000;
        assert_eq!(cpu.step(), ExecStatus::Aborted);
        assert_eq!(cpu.timing.cycles(), 0);
    }

    #[test]
    fn shld_merges_from_the_source_register() {
        // SHLD AX, BX, 4
        let mut cpu = cpu_with_code(&[0x0F, 0xA4, 0xD8, 0x04]);
        cpu.set_reg16(0, 0x1234);
        cpu.set_reg16(3, 0xABCD);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg16(0), 0x234A);
        assert!(cpu.flags.carry());
        assert_eq!(cpu.timing.cycles(), 3);
    }

    #[test]
    fn shrd_dword_by_cl() {
        // 66 0F AD D8 -> SHRD EAX, EBX, CL
        let mut cpu = cpu_with_code(&[0x66, 0x0F, 0xAD, 0xD8]);
        cpu.gpr[0] = 0x0000_0009;
        cpu.gpr[3] = 0x0000_0008;
        cpu.set_reg8(1, 4);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        // Low bits of EBX rotate in at the top; bit 3 of EAX is the carry.
        assert_eq!(cpu.gpr[0], 0x8000_0000);
        cpu.flags.rebuild();
        assert!(cpu.flags.carry());
        assert!(!cpu.flags.zero());
    }

    #[test]
    fn shrd_zero_count_still_charges() {
        // SHRD AX, BX, 0
        let mut cpu = cpu_with_code(&[0x0F, 0xAC, 0xD8, 0x00]);
        cpu.set_reg16(0, 0x1234);
        cpu.flags.load(0x0001);
        assert_eq!(cpu.step(), ExecStatus::Completed);
        assert_eq!(cpu.reg16(0), 0x1234);
        assert!(cpu.flags.carry());
        assert_eq!(cpu.timing.cycles(), 3);
    }
}
