//! Frame type flag constants
//!
//! Values match the frame type word used by hardware encoder runtimes so that
//! external rate controllers can pass them through unchanged.

pub const UNKNOWN: u16 = 0x0000;

// Coding type (exactly one is expected)
pub const I: u16 = 0x0001;
pub const P: u16 = 0x0002;
pub const B: u16 = 0x0004;

// Reference usage
pub const REF: u16 = 0x0040;
pub const IDR: u16 = 0x0080;
