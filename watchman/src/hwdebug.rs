/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pure encode/decode logic for the x86-64 debug control (DR7) and status
//! (DR6) registers. No I/O lives here; callers read and write the real
//! registers through `watchman_trace::DebugRegister`.
//!
//! DR7 layout, per slot `n` in 0..4:
//!   - bit `2n`: local-enable
//!   - bits `16+4n .. 16+4n+4`: `(rw << 2) | len`
//!
//! DR6 layout: bits 0..4 report which slot fired; bit 14 is the single-step
//! flag, a distinct condition that must never be read as a watch hit.

use crate::watch::WatchSize;

/// Number of hardware watchpoint slots per thread.
pub const NUM_SLOTS: usize = 4;

// Break on data write; reads and instruction fetches are never watched.
const RW_WRITE: u64 = 0b01;

const DR6_WATCH_MASK: u64 = 0xf;
const DR6_SINGLE_STEP: u64 = 1 << 14;

fn length_bits(size: WatchSize) -> u64 {
    match size {
        WatchSize::Bytes1 => 0b00,
        WatchSize::Bytes2 => 0b01,
        WatchSize::Bytes4 => 0b11,
        WatchSize::Bytes8 => 0b10,
    }
}

/// An image of the DR7 control word. Recomputed from the watch registry each
/// time a thread is armed; never persisted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Dr7(u64);

impl Dr7 {
    /// A control word with every slot disarmed.
    pub const EMPTY: Dr7 = Dr7(0);

    /// Wraps a raw register value.
    pub fn from_raw(raw: u64) -> Self {
        Dr7(raw)
    }

    /// The raw register value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Arms `slot` as a write watch of the given size, leaving every other
    /// slot's bits untouched.
    pub fn set_slot(self, slot: usize, size: WatchSize) -> Self {
        let cleared = self.clear_slot(slot);
        let field = (RW_WRITE << 2) | length_bits(size);
        Dr7(cleared.0 | local_enable_bit(slot) | (field << field_shift(slot)))
    }

    /// Disarms `slot` alone.
    pub fn clear_slot(self, slot: usize) -> Self {
        assert!(slot < NUM_SLOTS, "slot out of range: {}", slot);
        Dr7(self.0 & !local_enable_bit(slot) & !(0xf << field_shift(slot)))
    }

    /// Whether `slot` is locally enabled.
    pub fn slot_enabled(self, slot: usize) -> bool {
        assert!(slot < NUM_SLOTS, "slot out of range: {}", slot);
        self.0 & local_enable_bit(slot) != 0
    }
}

fn local_enable_bit(slot: usize) -> u64 {
    1 << (2 * slot)
}

fn field_shift(slot: usize) -> u64 {
    16 + 4 * slot as u64
}

/// An ephemeral snapshot of the DR6 status word, read on a trap and cleared
/// before the thread resumes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Dr6(u64);

impl Dr6 {
    /// Wraps a raw register value.
    pub fn from_raw(raw: u64) -> Self {
        Dr6(raw)
    }

    /// True if any of the four watch bits is set.
    pub fn any_watch_hit(self) -> bool {
        self.0 & DR6_WATCH_MASK != 0
    }

    /// The slots that fired, low bit first. The single-step flag (bit 14)
    /// does not contribute.
    pub fn fired_slots(self) -> impl Iterator<Item = usize> {
        let bits = self.0 & DR6_WATCH_MASK;
        (0..NUM_SLOTS).filter(move |slot| bits & (1 << slot) != 0)
    }

    /// True if the single-step flag is set.
    pub fn single_step(self) -> bool {
        self.0 & DR6_SINGLE_STEP != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_SIZES: [WatchSize; 4] = [
        WatchSize::Bytes1,
        WatchSize::Bytes2,
        WatchSize::Bytes4,
        WatchSize::Bytes8,
    ];

    // Pre-existing register contents a set_slot must not disturb outside its
    // own slot's bits.
    const PRE_WORDS: [u64; 5] = [0, u64::MAX, 0x5555_5555_5555_5555, 0xdead_beef_0bad_f00d, 0xff];

    fn slot_mask(slot: usize) -> u64 {
        local_enable_bit(slot) | (0xf << field_shift(slot))
    }

    fn field(dr7: Dr7, slot: usize) -> (u64, u64) {
        let bits = dr7.raw() >> field_shift(slot);
        ((bits >> 2) & 0b11, bits & 0b11)
    }

    #[test]
    fn set_slot_round_trips_and_isolates() {
        for pre in PRE_WORDS {
            for slot in 0..NUM_SLOTS {
                for size in ALL_SIZES {
                    let armed = Dr7::from_raw(pre).set_slot(slot, size);
                    assert!(armed.slot_enabled(slot));

                    let (rw, len) = field(armed, slot);
                    assert_eq!(rw, 0b01, "access type must be break-on-write");
                    assert_eq!(len, length_bits(size));

                    // every bit outside this slot's field and enable is
                    // untouched
                    let outside = !slot_mask(slot);
                    assert_eq!(
                        armed.raw() & outside,
                        pre & outside,
                        "slot {} size {:?} pre {:#x}",
                        slot,
                        size,
                        pre
                    );
                }
            }
        }
    }

    #[test]
    fn clear_slot_leaves_other_slots_armed() {
        let mut dr7 = Dr7::EMPTY;
        for slot in 0..NUM_SLOTS {
            dr7 = dr7.set_slot(slot, WatchSize::Bytes4);
        }

        for cleared in 0..NUM_SLOTS {
            let after = dr7.clear_slot(cleared);
            assert!(!after.slot_enabled(cleared));
            assert_eq!(after.raw() & slot_mask(cleared), 0);
            for other in (0..NUM_SLOTS).filter(|&s| s != cleared) {
                assert!(after.slot_enabled(other));
                assert_eq!(field(after, other), (0b01, 0b11));
            }
        }
    }

    #[test]
    fn length_encoding_matches_hardware() {
        assert_eq!(length_bits(WatchSize::Bytes1), 0b00);
        assert_eq!(length_bits(WatchSize::Bytes2), 0b01);
        assert_eq!(length_bits(WatchSize::Bytes4), 0b11);
        assert_eq!(length_bits(WatchSize::Bytes8), 0b10);
    }

    #[test]
    fn dr6_single_step_is_not_a_watch_hit() {
        let dr6 = Dr6::from_raw(1 << 14);
        assert!(dr6.single_step());
        assert!(!dr6.any_watch_hit());
        assert_eq!(dr6.fired_slots().count(), 0);
    }

    #[test]
    fn dr6_decodes_fired_slots() {
        let dr6 = Dr6::from_raw(0b0101);
        assert!(dr6.any_watch_hit());
        assert_eq!(dr6.fired_slots().collect::<Vec<_>>(), vec![0, 2]);

        // single-step flag alongside real hits does not add a slot
        let dr6 = Dr6::from_raw((1 << 14) | 0b1000);
        assert_eq!(dr6.fired_slots().collect::<Vec<_>>(), vec![3]);

        assert!(!Dr6::from_raw(0).any_watch_hit());
    }
}
