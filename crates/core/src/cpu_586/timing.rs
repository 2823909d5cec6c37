//! Cycle accounting for the interpreter core.
//!
//! Costs come from the documented per-instruction timing table and
//! distinguish register- from memory-resident operands. Two historical core
//! models are supported for the rotate-through-carry family:
//!
//! - [`TimingModel::Serial`]: the rotate is performed by a bit-serial
//!   shifter, so RCL/RCR cost cycles proportional to the iterated count.
//! - [`TimingModel::Barrel`]: a barrel shifter gives a constant operation
//!   cost, but the pipeline charges `count` warm-up cycles up front,
//!   whether or not the instruction later aborts.
//!
//! The warm-up rule is a calibration table taken from measured silicon, not
//! something derived from the documented microarchitecture.

use serde::{Deserialize, Serialize};

/// Rotate-through-carry cost model of the emulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingModel {
    /// Bit-serial shifter: RCL/RCR charge per iterated bit.
    Serial,
    /// Barrel shifter: constant cost plus an unconditional up-front
    /// `count`-cycle warm-up charge.
    Barrel,
}

/// Per-CPU cycle accountant.
///
/// Purely additive; never fails. Cycles charged before a handler aborts
/// (fetched instruction bytes, barrel warm-up) are never rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    model: TimingModel,
    /// Cycles charged by completed data-path work and warm-up.
    cycles: u64,
    /// Cycles charged for instruction bytes physically fetched.
    fetch_cycles: u64,
}

/// Cycles charged per bit by the serial model for RCL/RCR.
const SERIAL_CYCLES_PER_BIT: u32 = 4;

impl Timing {
    pub fn new(model: TimingModel) -> Self {
        Self {
            model,
            cycles: 0,
            fetch_cycles: 0,
        }
    }

    pub fn model(&self) -> TimingModel {
        self.model
    }

    /// Execution cycles charged so far (excludes instruction fetch).
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycles charged for instruction-byte fetches.
    pub fn fetch_cycles(&self) -> u64 {
        self.fetch_cycles
    }

    pub fn total_cycles(&self) -> u64 {
        self.cycles + self.fetch_cycles
    }

    pub fn reset(&mut self) {
        self.cycles = 0;
        self.fetch_cycles = 0;
    }

    /// Charge `n` execution cycles.
    pub fn charge(&mut self, n: u32) {
        self.cycles += n as u64;
    }

    /// Record instruction bytes pulled through the prefetch path.
    ///
    /// One cycle per byte, charged at fetch time; the charge stands even if
    /// the handler aborts on a later operand access.
    pub fn note_fetch(&mut self, bytes: u32) {
        self.fetch_cycles += bytes as u64;
    }

    /// Cost of ROL/ROR/SHL/SHR/SAR once the count is non-zero.
    pub fn charge_shift(&mut self, reg_operand: bool) {
        self.charge(if reg_operand { 3 } else { 7 });
    }

    /// Cost of a double-precision shift (SHLD/SHRD).
    pub fn charge_double_shift(&mut self) {
        self.charge(3);
    }

    /// Up-front charge for RCL/RCR, before any write-back.
    ///
    /// Serial cores pay per bit inside the rotate loop instead; see
    /// [`Timing::charge_rcl_bit`].
    pub fn charge_rotate_carry_setup(&mut self, count: u32) {
        if self.model == TimingModel::Barrel {
            self.charge(count);
        }
    }

    /// Per-iteration charge of the bit-serial rotate loop.
    pub fn charge_rcl_bit(&mut self) {
        if self.model == TimingModel::Serial {
            self.charge(SERIAL_CYCLES_PER_BIT);
        }
    }

    /// Constant completion cost of RCL/RCR on barrel cores.
    pub fn charge_rotate_carry(&mut self, reg_operand: bool) {
        if self.model == TimingModel::Barrel {
            self.charge(if reg_operand { 9 } else { 10 });
        }
    }

    /// Cost of a packed-SIMD operation.
    pub fn charge_mmx(&mut self, reg_operand: bool) {
        self.charge(if reg_operand { 1 } else { 2 });
    }
}
