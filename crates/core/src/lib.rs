//! Core execution engine of a PC-compatible system emulator.
//!
//! The heart of this crate is [`cpu_586`], a Pentium-class x86 interpreter
//! core: per-opcode handlers for the shift/rotate and packed-SIMD (MMX)
//! families, a lazy flags engine, the effective-address/memory-fault
//! protocol, and the MMX/x87 register overlay. Device models, chipset
//! decoding and the UI shell live in other crates and talk to this one only
//! through the [`cpu_586::Memory586`] trait and the fault/abort protocol.

pub mod cpu_586;
pub mod logging;

pub use cpu_586::ExecStatus;

/// A CPU-like component that can be stepped one instruction at a time.
pub trait Cpu {
    /// Reset to initial power-on state.
    fn reset(&mut self);

    /// Execute one instruction.
    ///
    /// Returns [`ExecStatus::Aborted`] when an operand access faulted; the
    /// caller must not retire the instruction in that case.
    fn step(&mut self) -> ExecStatus;

    /// Total execution cycles charged so far.
    fn cycles(&self) -> u64;
}
