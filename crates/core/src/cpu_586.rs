//! Pentium-class x86 interpreter core.
//!
//! # Architecture
//!
//! - **Cpu586**: register file, prefix handling, opcode dispatch
//! - **flags**: EFLAGS with lazy arithmetic-flag materialization
//! - **ea**: ModR/M decoding and effective-address resolution
//! - **shift**: group-2 shifts/rotates and SHLD/SHRD
//! - **mmx**: packed-integer arithmetic and the MMX/x87 overlay
//! - **timing**: per-model cycle accounting
//!
//! # Fault protocol
//!
//! Every memory access returns `Result<_, MemFault>` and handlers
//! propagate with `?`. A fault unwinds the instruction immediately:
//! [`Cpu586::step`] reports [`ExecStatus::Aborted`], stashes the fault for
//! the platform's exception plumbing, and does not retire the instruction.
//! Writes performed before the faulting access are not rolled back, and
//! neither are cycles already charged.
//!
//! The core executes with real-mode addressing (`segment * 16 + offset`);
//! paging and protected-mode translation belong to the bus implementation
//! behind [`Memory586`].

mod ea;
mod flags;
mod mmx;
mod shift;
mod timing;

pub use ea::{AddrSize, EffAddr, Operand};
pub use flags::{
    parity, sign_extend, Flags, PendingOp, Width, FLAG_A, FLAG_C, FLAG_O, FLAG_P, FLAG_S, FLAG_Z,
};
pub use mmx::{combine, FpuSlot, MmxOp, MmxReg, PACKED_SIGN_EXP};
pub use timing::{Timing, TimingModel};

use serde::{Deserialize, Serialize};
use shift::CountSource;
use thiserror::Error;

use crate::logging::{log, LogCategory, LogLevel};

/// Which silicon the core is imitating. Selects the timing model and the
/// available instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuModel {
    Intel80386,
    Intel80486,
    PentiumMmx,
}

impl CpuModel {
    pub fn timing_model(self) -> TimingModel {
        match self {
            CpuModel::Intel80386 => TimingModel::Serial,
            CpuModel::Intel80486 | CpuModel::PentiumMmx => TimingModel::Barrel,
        }
    }

    pub fn has_mmx(self) -> bool {
        matches!(self, CpuModel::PentiumMmx)
    }
}

/// A failed data or instruction access, carrying the physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MemFault {
    #[error("read fault at physical address {addr:#07X}")]
    Read { addr: u32 },
    #[error("write fault at physical address {addr:#07X}")]
    Write { addr: u32 },
}

impl MemFault {
    pub fn addr(&self) -> u32 {
        match *self {
            MemFault::Read { addr } | MemFault::Write { addr } => addr,
        }
    }
}

/// Outcome of [`Cpu586::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The instruction ran to completion and was retired.
    Completed,
    /// An access faulted mid-instruction; nothing was retired.
    Aborted,
}

/// Segment register selectors, in descriptor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(usize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// The bus the core executes against. Only byte access is required; the
/// wider accessors default to little-endian composition and may be
/// overridden by buses with native wide ports.
pub trait Memory586 {
    fn read_u8(&mut self, addr: u32) -> Result<u8, MemFault>;
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemFault>;

    fn read_u16(&mut self, addr: u32) -> Result<u16, MemFault> {
        let lo = self.read_u8(addr)? as u16;
        let hi = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), MemFault> {
        self.write_u8(addr, value as u8)?;
        self.write_u8(addr.wrapping_add(1), (value >> 8) as u8)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, MemFault> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemFault> {
        self.write_u16(addr, value as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)
    }
}

/// The interpreter core itself, generic over the bus it executes against.
pub struct Cpu586<M: Memory586> {
    /// General registers in ModR/M encoding order:
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
    pub gpr: [u32; 8],
    segments: [u16; 6],
    pub eip: u32,
    pub flags: Flags,
    /// Dedicated MMX register file, used when `softfloat` is off.
    pub mm: [MmxReg; 8],
    /// x87 data stack; carries the MMX state when `softfloat` is on.
    pub fpu: [FpuSlot; 8],
    pub fpu_top: u8,
    pub fpu_tag: u16,
    softfloat: bool,
    pub timing: Timing,
    model: CpuModel,
    instructions: u64,
    last_fault: Option<MemFault>,
    segment_override: Option<SegReg>,
    addr_size: AddrSize,
    pub memory: M,
}

/// Serialized architectural state. The bus is not part of it; platforms
/// snapshot their memory and devices separately.
#[derive(Serialize, Deserialize)]
struct CpuSnapshot {
    gpr: [u32; 8],
    segments: [u16; 6],
    eip: u32,
    flags: u16,
    mm: [MmxReg; 8],
    fpu: [FpuSlot; 8],
    fpu_top: u8,
    fpu_tag: u16,
    softfloat: bool,
    model: CpuModel,
    timing: Timing,
    instructions: u64,
}

impl<M: Memory586> Cpu586<M> {
    pub fn new(memory: M, model: CpuModel) -> Self {
        Self {
            gpr: [0; 8],
            segments: [0; 6],
            eip: 0,
            flags: Flags::new(),
            mm: [MmxReg::default(); 8],
            fpu: [FpuSlot::default(); 8],
            fpu_top: 0,
            fpu_tag: 0,
            softfloat: false,
            timing: Timing::new(model.timing_model()),
            model,
            instructions: 0,
            last_fault: None,
            segment_override: None,
            addr_size: AddrSize::A16,
            memory,
        }
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// The fault that aborted the most recent [`step`](Cpu586::step), if
    /// any. This is the boundary the platform's exception delivery hangs
    /// off; the core itself only records it.
    pub fn last_fault(&self) -> Option<MemFault> {
        self.last_fault
    }

    pub fn segments(&self) -> &[u16; 6] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [u16; 6] {
        &mut self.segments
    }

    pub fn softfloat(&self) -> bool {
        self.softfloat
    }

    /// Switch between the dedicated MMX register file and the x87-overlay
    /// rendition. Register contents carry across the switch; enabling the
    /// overlay stamps every slot as holding packed data.
    pub fn set_softfloat(&mut self, enabled: bool) {
        if enabled == self.softfloat {
            return;
        }
        log(LogCategory::Fpu, LogLevel::Info, || {
            format!("softfloat {}", if enabled { "on" } else { "off" })
        });
        if enabled {
            for i in 0..8 {
                self.fpu[i].write_packed(self.mm[i].0);
            }
        } else {
            for i in 0..8 {
                self.mm[i] = MmxReg(self.fpu[i].fraction);
            }
        }
        self.softfloat = enabled;
    }

    /// Power-on state: execution resumes at the top-of-memory reset
    /// vector, flags cleared, counters zeroed.
    pub fn reset(&mut self) {
        self.reset_at(0xF000, 0xFFF0);
    }

    /// Reset with an explicit CS:IP, for harnesses that place code at a
    /// known address.
    pub fn reset_at(&mut self, cs: u16, ip: u32) {
        self.gpr = [0; 8];
        self.segments = [0; 6];
        self.segments[SegReg::Cs as usize] = cs;
        self.eip = ip;
        self.flags = Flags::new();
        self.mm = [MmxReg::default(); 8];
        self.fpu = [FpuSlot::default(); 8];
        self.fpu_top = 0;
        self.fpu_tag = 0;
        self.timing.reset();
        self.instructions = 0;
        self.last_fault = None;
        self.segment_override = None;
        self.addr_size = AddrSize::A16;
    }

    // --- register file ---

    /// 8-bit register: indices 0-3 are AL/CL/DL/BL, 4-7 are AH/CH/DH/BH.
    pub fn reg8(&self, r: u8) -> u8 {
        let r = r as usize;
        if r < 4 {
            self.gpr[r] as u8
        } else {
            (self.gpr[r - 4] >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, r: u8, value: u8) {
        let r = r as usize;
        if r < 4 {
            self.gpr[r] = (self.gpr[r] & !0xFF) | value as u32;
        } else {
            self.gpr[r - 4] = (self.gpr[r - 4] & !0xFF00) | ((value as u32) << 8);
        }
    }

    pub fn reg16(&self, r: u8) -> u16 {
        self.gpr[r as usize] as u16
    }

    pub fn set_reg16(&mut self, r: u8, value: u16) {
        let r = r as usize;
        self.gpr[r] = (self.gpr[r] & !0xFFFF) | value as u32;
    }

    // --- memory access ---

    fn phys(&self, seg: SegReg, offset: u32) -> u32 {
        ((self.segments[seg as usize] as u32) << 4).wrapping_add(offset)
    }

    pub fn read_u8(&mut self, seg: SegReg, offset: u32) -> Result<u8, MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.read_u8(addr)
    }

    pub fn read_u16(&mut self, seg: SegReg, offset: u32) -> Result<u16, MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.read_u16(addr)
    }

    pub fn read_u32(&mut self, seg: SegReg, offset: u32) -> Result<u32, MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.read_u32(addr)
    }

    pub fn write_u8(&mut self, seg: SegReg, offset: u32, value: u8) -> Result<(), MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.write_u8(addr, value)
    }

    pub fn write_u16(&mut self, seg: SegReg, offset: u32, value: u16) -> Result<(), MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.write_u16(addr, value)
    }

    pub fn write_u32(&mut self, seg: SegReg, offset: u32, value: u32) -> Result<(), MemFault> {
        let addr = self.phys(seg, offset);
        self.memory.write_u32(addr, value)
    }

    // --- instruction stream ---

    /// Fetch one instruction byte at CS:EIP, charging a fetch cycle. The
    /// charge stands even if the instruction later aborts.
    pub(crate) fn fetch_u8(&mut self) -> Result<u8, MemFault> {
        let byte = self.read_u8(SegReg::Cs, self.eip)?;
        self.timing.note_fetch(1);
        self.eip = self.eip.wrapping_add(1);
        Ok(byte)
    }

    pub(crate) fn fetch_u16(&mut self) -> Result<u16, MemFault> {
        let lo = self.fetch_u8()? as u16;
        let hi = self.fetch_u8()? as u16;
        Ok(lo | (hi << 8))
    }

    pub(crate) fn fetch_u32(&mut self) -> Result<u32, MemFault> {
        let lo = self.fetch_u16()? as u32;
        let hi = self.fetch_u16()? as u32;
        Ok(lo | (hi << 16))
    }

    // --- execution ---

    /// Execute one instruction.
    pub fn step(&mut self) -> ExecStatus {
        self.last_fault = None;
        match self.exec_one() {
            Ok(()) => {
                self.instructions += 1;
                ExecStatus::Completed
            }
            Err(fault) => {
                log(LogCategory::Mem, LogLevel::Debug, || {
                    format!("instruction aborted: {fault}")
                });
                self.last_fault = Some(fault);
                ExecStatus::Aborted
            }
        }
    }

    fn exec_one(&mut self) -> Result<(), MemFault> {
        self.segment_override = None;
        self.addr_size = AddrSize::A16;
        let mut operand_size_32 = false;

        let opcode = loop {
            match self.fetch_u8()? {
                0x26 => self.segment_override = Some(SegReg::Es),
                0x2E => self.segment_override = Some(SegReg::Cs),
                0x36 => self.segment_override = Some(SegReg::Ss),
                0x3E => self.segment_override = Some(SegReg::Ds),
                0x64 => self.segment_override = Some(SegReg::Fs),
                0x65 => self.segment_override = Some(SegReg::Gs),
                0x66 => operand_size_32 = true,
                0x67 => self.addr_size = AddrSize::A32,
                other => break other,
            }
        };
        let opsize = if operand_size_32 {
            Width::Dword
        } else {
            Width::Word
        };

        match opcode {
            0x90 => self.timing.charge(1), // NOP
            0xC0 => self.exec_shift_group(Width::Byte, CountSource::Imm)?,
            0xC1 => self.exec_shift_group(opsize, CountSource::Imm)?,
            0xD0 => self.exec_shift_group(Width::Byte, CountSource::One)?,
            0xD1 => self.exec_shift_group(opsize, CountSource::One)?,
            0xD2 => self.exec_shift_group(Width::Byte, CountSource::Cl)?,
            0xD3 => self.exec_shift_group(opsize, CountSource::Cl)?,
            0x0F => self.exec_0f(opsize)?,
            other => {
                log(LogCategory::Cpu, LogLevel::Warn, || {
                    format!("unhandled opcode {other:02X} at {:08X}", self.eip)
                });
            }
        }
        Ok(())
    }

    fn exec_0f(&mut self, opsize: Width) -> Result<(), MemFault> {
        let op2 = self.fetch_u8()?;
        match op2 {
            0xA4 => self.exec_double_shift(opsize, true, true),
            0xA5 => self.exec_double_shift(opsize, true, false),
            0xAC => self.exec_double_shift(opsize, false, true),
            0xAD => self.exec_double_shift(opsize, false, false),
            _ => {
                if let Some(op) = mmx_opcode(op2) {
                    if self.model.has_mmx() {
                        return self.exec_mmx(op);
                    }
                    log(LogCategory::Cpu, LogLevel::Warn, || {
                        format!("MMX opcode 0F {op2:02X} on {:?}", self.model)
                    });
                } else {
                    log(LogCategory::Cpu, LogLevel::Warn, || {
                        format!("unhandled opcode 0F {op2:02X} at {:08X}", self.eip)
                    });
                }
                Ok(())
            }
        }
    }

    // --- save states ---

    pub fn save_state(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&CpuSnapshot {
            gpr: self.gpr,
            segments: self.segments,
            eip: self.eip,
            flags: self.flags.materialized(),
            mm: self.mm,
            fpu: self.fpu,
            fpu_top: self.fpu_top,
            fpu_tag: self.fpu_tag,
            softfloat: self.softfloat,
            model: self.model,
            timing: self.timing.clone(),
            instructions: self.instructions,
        })
    }

    pub fn load_state(&mut self, json: &str) -> Result<(), serde_json::Error> {
        let snap: CpuSnapshot = serde_json::from_str(json)?;
        self.gpr = snap.gpr;
        self.segments = snap.segments;
        self.eip = snap.eip;
        self.flags.load(snap.flags);
        self.mm = snap.mm;
        self.fpu = snap.fpu;
        self.fpu_top = snap.fpu_top;
        self.fpu_tag = snap.fpu_tag;
        self.softfloat = snap.softfloat;
        self.model = snap.model;
        self.timing = snap.timing;
        self.instructions = snap.instructions;
        self.last_fault = None;
        Ok(())
    }
}

impl<M: Memory586> crate::Cpu for Cpu586<M> {
    fn reset(&mut self) {
        Cpu586::reset(self);
    }

    fn step(&mut self) -> ExecStatus {
        Cpu586::step(self)
    }

    fn cycles(&self) -> u64 {
        self.timing.total_cycles()
    }
}

fn mmx_opcode(op2: u8) -> Option<MmxOp> {
    Some(match op2 {
        0xD5 => MmxOp::Pmullw,
        0xD8 => MmxOp::Psubusb,
        0xD9 => MmxOp::Psubusw,
        0xDC => MmxOp::Paddusb,
        0xDD => MmxOp::Paddusw,
        0xE5 => MmxOp::Pmulhw,
        0xE8 => MmxOp::Psubsb,
        0xE9 => MmxOp::Psubsw,
        0xEC => MmxOp::Paddsb,
        0xED => MmxOp::Paddsw,
        0xF5 => MmxOp::Pmaddwd,
        0xF8 => MmxOp::Psubb,
        0xF9 => MmxOp::Psubw,
        0xFA => MmxOp::Psubd,
        0xFC => MmxOp::Paddb,
        0xFD => MmxOp::Paddw,
        0xFE => MmxOp::Paddd,
        _ => return None,
    })
}

/// Flat RAM bus for tests and benchmarks. Accesses past the end fault,
/// which doubles as the test double for bus errors.
pub struct ArrayMemory {
    data: Vec<u8>,
}

impl ArrayMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn load_program(&mut self, addr: u32, bytes: &[u8]) {
        let addr = addr as usize;
        self.data[addr..addr + bytes.len()].copy_from_slice(bytes);
    }
}

impl Memory586 for ArrayMemory {
    fn read_u8(&mut self, addr: u32) -> Result<u8, MemFault> {
        self.data
            .get(addr as usize)
            .copied()
            .ok_or(MemFault::Read { addr })
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemFault> {
        match self.data.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MemFault::Write { addr }),
        }
    }
}
