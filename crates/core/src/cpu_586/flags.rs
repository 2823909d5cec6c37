//! EFLAGS with lazy (deferred) arithmetic-flag materialization.
//!
//! Shift instructions do not compute C/P/A/Z/S/O at execution time. They
//! record the operation's inputs and result and leave the flag bits stale;
//! the record is only folded into the flags word when somebody asks for it.
//! Rotates, by contrast, touch only CF and OF and must therefore start from
//! concrete flags (the other arithmetic bits keep their previous values).

use serde::{Deserialize, Serialize};

pub const FLAG_C: u16 = 0x0001;
pub const FLAG_P: u16 = 0x0004;
pub const FLAG_A: u16 = 0x0010;
pub const FLAG_Z: u16 = 0x0040;
pub const FLAG_S: u16 = 0x0080;
pub const FLAG_O: u16 = 0x0800;

/// All bits owned by the lazy engine.
const ARITH_MASK: u16 = FLAG_C | FLAG_P | FLAG_A | FLAG_Z | FLAG_S | FLAG_O;

/// Bit 1 of EFLAGS always reads as 1.
const FLAGS_FIXED: u16 = 0x0002;

/// Operand width of a handler, with the bit-level constants each width
/// implies. Handlers are written once against this enum instead of being
/// triplicated per width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
            Width::Dword => 0x8000_0000,
        }
    }
}

/// Sign-extend `value` (of the given width) to 32 bits.
pub fn sign_extend(value: u32, width: Width) -> u32 {
    match width {
        Width::Byte => value as u8 as i8 as i32 as u32,
        Width::Word => value as u16 as i16 as i32 as u32,
        Width::Dword => value,
    }
}

/// Parity flag is set when the low byte of the result has an even number of
/// one bits.
pub fn parity(result: u32) -> bool {
    (result as u8).count_ones() % 2 == 0
}

/// Which deferred operation produced the pending result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOp {
    /// Left shift: carry and overflow derive from bits shifted out the top.
    Shl,
    /// Logical right shift: carry derives from the last bit shifted out the
    /// bottom; overflow is set only for a one-bit shift of a negative value.
    Shr,
    /// Arithmetic right shift: carry from the last bit out; overflow clear.
    Sar,
    /// Result-only record: Z/S/P from the result, C/A/O clear.
    Znp,
}

/// Inputs and result of a not-yet-materialized flag computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending {
    pub op: PendingOp,
    pub width: Width,
    /// First operand (the pre-shift value).
    pub op1: u32,
    /// Second operand (the effective shift count).
    pub op2: u32,
    /// Masked result.
    pub res: u32,
}

/// Current state of the arithmetic flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Record {
    /// The flags word holds the truth.
    Concrete,
    /// The flags word is stale; this record holds the inputs needed to
    /// recompute the arithmetic bits.
    Owed(Pending),
}

/// The EFLAGS register (low 16 bits) plus the lazy-evaluation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flags {
    word: u16,
    record: Record,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new()
    }
}

impl Flags {
    pub fn new() -> Self {
        Self {
            word: FLAGS_FIXED,
            record: Record::Concrete,
        }
    }

    /// True when a deferred computation has not yet been folded in.
    pub fn is_owed(&self) -> bool {
        matches!(self.record, Record::Owed(_))
    }

    /// Fold any pending record into the flags word. Idempotent.
    pub fn rebuild(&mut self) {
        if let Record::Owed(pending) = self.record {
            self.word = Self::materialize(self.word, pending);
            self.record = Record::Concrete;
        }
    }

    /// The flags word with any pending record applied, without mutating.
    ///
    /// Used by state snapshots, which take `&self`.
    pub fn materialized(&self) -> u16 {
        match self.record {
            Record::Concrete => self.word,
            Record::Owed(pending) => Self::materialize(self.word, pending),
        }
    }

    /// Replace the whole flags word with concrete bits.
    pub fn load(&mut self, word: u16) {
        self.word = (word & !FLAGS_FIXED) | FLAGS_FIXED;
        self.record = Record::Concrete;
    }

    fn materialize(word: u16, p: Pending) -> u16 {
        let sign = p.width.sign_bit();
        let mut out: u16 = 0;
        // Z/S/P come from the result for every deferred kind; A is always
        // clear after a shift.
        if p.res == 0 {
            out |= FLAG_Z;
        }
        if p.res & sign != 0 {
            out |= FLAG_S;
        }
        if parity(p.res) {
            out |= FLAG_P;
        }
        match p.op {
            PendingOp::Shl => {
                if (p.op1 << (p.op2 - 1)) & sign != 0 {
                    out |= FLAG_C;
                }
                if ((p.op1 << p.op2) ^ (p.op1 << (p.op2 - 1))) & sign != 0 {
                    out |= FLAG_O;
                }
            }
            PendingOp::Shr => {
                if (p.op1 >> (p.op2 - 1)) & 1 != 0 {
                    out |= FLAG_C;
                }
                if p.op2 == 1 && p.op1 & sign != 0 {
                    out |= FLAG_O;
                }
            }
            PendingOp::Sar => {
                if (sign_extend(p.op1, p.width) >> (p.op2 - 1)) & 1 != 0 {
                    out |= FLAG_C;
                }
            }
            PendingOp::Znp => {}
        }
        (word & !ARITH_MASK) | out
    }

    /// Record a deferred shift-flag computation, leaving the flags word
    /// stale until the next rebuild.
    pub fn set_shift(&mut self, op: PendingOp, width: Width, op1: u32, op2: u32, res: u32) {
        self.record = Record::Owed(Pending {
            op,
            width,
            op1,
            op2,
            res,
        });
    }

    /// Record a result-only computation (Z/S/P from the result, C/A/O
    /// clear).
    pub fn set_znp(&mut self, width: Width, res: u32) {
        self.set_shift(PendingOp::Znp, width, 0, 0, res);
    }

    fn get(&self, bit: u16) -> bool {
        debug_assert!(matches!(self.record, Record::Concrete));
        self.word & bit != 0
    }

    fn set(&mut self, bit: u16, value: bool) {
        debug_assert!(matches!(self.record, Record::Concrete));
        if value {
            self.word |= bit;
        } else {
            self.word &= !bit;
        }
    }

    // Concrete bit accessors. Callers must rebuild first; rotates do, by
    // contract, before consulting or updating CF/OF.

    pub fn carry(&self) -> bool {
        self.get(FLAG_C)
    }

    pub fn set_carry(&mut self, value: bool) {
        self.set(FLAG_C, value);
    }

    pub fn overflow(&self) -> bool {
        self.get(FLAG_O)
    }

    pub fn set_overflow(&mut self, value: bool) {
        self.set(FLAG_O, value);
    }

    pub fn zero(&self) -> bool {
        self.get(FLAG_Z)
    }

    pub fn sign(&self) -> bool {
        self.get(FLAG_S)
    }

    pub fn parity_flag(&self) -> bool {
        self.get(FLAG_P)
    }

    pub fn adjust(&self) -> bool {
        self.get(FLAG_A)
    }
}
