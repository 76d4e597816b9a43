//! x86-64 debug registers and the bit layout of the debug control register (DR7).
//!
//! DR7 layout, low 32 bits:
//!
//! ```text
//!  31  29  27  25  23  21  19  17  15          8   7 6 5 4 3 2 1 0
//! +---+---+---+---+---+---+---+---+-------------+---+-+-+-+-+-+-+-+
//! |LN3|RW3|LN2|RW2|LN1|RW1|LN0|RW0|             |GE |G|L|G|L|G|L|G|L|
//! |   |   |   |   |   |   |   |   |             |LE |3|3|2|2|1|1|0|0|
//! +---+---+---+---+---+---+---+---+-------------+---+-+-+-+-+-+-+-+
//! ```
//!
//! Slot `n` is enabled locally by bit `2n`, and its condition (`RWn`) and length (`LNn`)
//! form the nibble at bit `16 + 4n`.

use crate::error::{Error, Result};

/// Number of address-watch slots provided by the hardware.
pub const SLOTS: usize = 4;

const ENABLE_BITS: u64 = 0b11;
const NIBBLE_MASK: u64 = 0xf;
const CONTROL_SHIFT: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugRegister {
    Dr0 = 0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,
}

impl DebugRegister {
    /// Return the offset into debug register array in the virtual `user` struct.
    pub(crate) fn user_offset() -> u64 {
        memoffset::offset_of!(libc::user, u_debugreg) as u64
    }

    /// Offset of this register in the virtual `user` struct, as passed to
    /// `PTRACE_PEEKUSER` and `PTRACE_POKEUSER`.
    pub(crate) fn offset(self) -> u64 {
        Self::user_offset() + 8 * u64::from(self)
    }

    pub(crate) fn from_index(index: u8) -> Option<Self> {
        use DebugRegister::*;

        let dr = match index {
            0 => Dr0,
            1 => Dr1,
            2 => Dr2,
            3 => Dr3,
            4 => Dr4,
            5 => Dr5,
            6 => Dr6,
            7 => Dr7,
            _ => return None,
        };

        Some(dr)
    }
}

impl From<DebugRegister> for u64 {
    fn from(dr: DebugRegister) -> u64 {
        dr as u64
    }
}

/// One of the four hardware breakpoint units.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Slot(u8);

impl Slot {
    pub const ALL: [Slot; SLOTS] = [Slot(0), Slot(1), Slot(2), Slot(3)];

    pub fn new(index: usize) -> Result<Self> {
        if index < SLOTS {
            Ok(Slot(index as u8))
        } else {
            Err(Error::InvalidSlot(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The address register (DR0 through DR3) backing this slot.
    pub fn address_register(self) -> DebugRegister {
        Self::ALL_REGISTERS[self.index()]
    }

    const ALL_REGISTERS: [DebugRegister; SLOTS] = [
        DebugRegister::Dr0,
        DebugRegister::Dr1,
        DebugRegister::Dr2,
        DebugRegister::Dr3,
    ];

    fn enable_shift(self) -> usize {
        2 * self.index()
    }

    fn control_shift(self) -> usize {
        CONTROL_SHIFT + 4 * self.index()
    }
}

impl TryFrom<usize> for Slot {
    type Error = Error;

    fn try_from(index: usize) -> Result<Self> {
        Slot::new(index)
    }
}

/// Access that triggers a breakpoint (`RWn`).
///
/// `0b10` selects I/O breakpoints, which are not available to user space. There is no
/// read-only condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Condition {
    Execute = 0b00,
    Write = 0b01,
    ReadWrite = 0b11,
}

impl Condition {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0b00 => Some(Condition::Execute),
            0b01 => Some(Condition::Write),
            0b11 => Some(Condition::ReadWrite),
            _ => None,
        }
    }
}

/// Size of the watched operand (`LENn`). The encoding is not ordered by size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Length {
    One = 0b00,
    Two = 0b01,
    Eight = 0b10,
    Four = 0b11,
}

impl Length {
    pub fn for_size(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Length::One),
            2 => Some(Length::Two),
            4 => Some(Length::Four),
            8 => Some(Length::Eight),
            _ => None,
        }
    }

    /// Length matching the width of a pointer.
    pub fn pointer_width() -> Self {
        Length::Eight
    }

    pub fn bytes(self) -> u64 {
        match self {
            Length::One => 1,
            Length::Two => 2,
            Length::Four => 4,
            Length::Eight => 8,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Length::One,
            0b01 => Length::Two,
            0b10 => Length::Eight,
            _ => Length::Four,
        }
    }
}

/// Control word that locally enables `slot` with the given condition and length.
pub fn encode(slot: Slot, condition: Condition, length: Length) -> u32 {
    let nibble = ((length as u32) << 2) | condition as u32;

    (1 << slot.enable_shift()) | (nibble << slot.control_shift())
}

/// Value of the debug control register (DR7).
///
/// Updates touch only the bits of the named slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DebugControl(u64);

impl DebugControl {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn enable(self, slot: Slot, condition: Condition, length: Length) -> Self {
        let cleared = self.disable(slot);

        Self(cleared.0 | u64::from(encode(slot, condition, length)))
    }

    /// Clear the local and global enable bits and the condition/length nibble of `slot`.
    pub fn disable(self, slot: Slot) -> Self {
        let mask = (ENABLE_BITS << slot.enable_shift()) | (NIBBLE_MASK << slot.control_shift());

        Self(self.0 & !mask)
    }

    pub fn is_enabled(self, slot: Slot) -> bool {
        (self.0 >> slot.enable_shift()) & ENABLE_BITS != 0
    }

    pub fn condition(self, slot: Slot) -> Option<Condition> {
        Condition::from_bits((self.0 >> slot.control_shift()) & 0b11)
    }

    pub fn length(self, slot: Slot) -> Length {
        Length::from_bits(self.0 >> (slot.control_shift() + 2))
    }
}

impl From<DebugControl> for u64 {
    fn from(control: DebugControl) -> u64 {
        control.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn slot(index: usize) -> Slot {
        Slot::new(index).unwrap()
    }

    #[test]
    fn test_encode_write_pointer_width_slot_0() {
        assert_eq!(encode(slot(0), Condition::Write, Length::Eight), 0x0009_0001);
    }

    #[test]
    fn test_encode_places_nibble_and_enable_per_slot() {
        assert_eq!(encode(slot(1), Condition::Execute, Length::One), 0x0000_0004);
        assert_eq!(encode(slot(2), Condition::Write, Length::Two), 0x0500_0010);
        assert_eq!(encode(slot(3), Condition::ReadWrite, Length::Four), 0xf000_0040);
    }

    #[test]
    fn test_length_encoding_is_not_monotonic() {
        assert_eq!(Length::for_size(4), Some(Length::Four));
        assert_eq!(Length::Four as u8, 0b11);
        assert_eq!(Length::Eight as u8, 0b10);
        assert_eq!(Length::for_size(3), None);
        assert_eq!(Length::for_size(16), None);
    }

    #[test]
    fn test_slot_out_of_range() {
        assert!(matches!(Slot::new(4), Err(Error::InvalidSlot(4))));
        assert!(matches!(Slot::try_from(usize::MAX), Err(Error::InvalidSlot(_))));
        assert_eq!(slot(3).address_register(), DebugRegister::Dr3);
    }

    #[test]
    fn test_enable_preserves_other_slots() {
        let control = DebugControl::default()
            .enable(slot(0), Condition::Write, Length::Eight)
            .enable(slot(2), Condition::ReadWrite, Length::Four);

        assert_eq!(control.raw(), 0x0f09_0011);
        assert!(control.is_enabled(slot(0)));
        assert!(!control.is_enabled(slot(1)));
        assert_eq!(control.condition(slot(2)), Some(Condition::ReadWrite));
        assert_eq!(control.length(slot(2)), Length::Four);
    }

    #[test]
    fn test_reenable_replaces_slot_bits() {
        let control = DebugControl::default()
            .enable(slot(1), Condition::ReadWrite, Length::Four)
            .enable(slot(1), Condition::Write, Length::One);

        assert_eq!(control.raw(), u64::from(encode(slot(1), Condition::Write, Length::One)));
    }

    #[test]
    fn test_disable_clears_enable_bits_and_nibble() {
        // Slot 0 enabled globally as well as locally, plus the `LE`/`GE` bits.
        let raw = 0x0009_0303;
        let control = DebugControl::from_raw(raw)
            .enable(slot(1), Condition::Write, Length::Eight)
            .disable(slot(0));

        assert!(!control.is_enabled(slot(0)));
        assert!(control.is_enabled(slot(1)));
        assert_eq!(control.raw(), 0x0090_0304);
    }
}
