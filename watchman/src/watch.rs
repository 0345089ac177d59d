/*
 * Copyright (c) Watchman Contributors.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The watch registry: a validated, immutable set of watched ranges.
//!
//! Descriptors are assigned to hardware slots 0..N-1 in registry order, so a
//! decoded status bit maps straight back to the descriptor that fired.

use std::fmt;

use thiserror::Error;

/// The hardware provides four watchpoint slots per thread; a registry can
/// never hold more descriptors than that.
pub const MAX_WATCHPOINTS: usize = 4;

/// A watch descriptor failed validation.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum WatchError {
    /// No watchpoints were given.
    #[error("no watchpoints given")]
    Empty,

    /// More descriptors than hardware slots.
    #[error("{0} watchpoints requested, hardware provides {MAX_WATCHPOINTS}")]
    TooMany(usize),

    /// The size is not a supported watch length. There is deliberately no
    /// fallback to 4 bytes here: a silently-widened watch fires on writes
    /// the user never asked about.
    #[error("unsupported watch size {0} (expected 1, 2, 4 or 8)")]
    UnsupportedSize(u64),

    /// The address is not aligned to the watch size, which the hardware
    /// cannot express.
    #[error("address {addr:#x} is not aligned to its watch size {size}")]
    Misaligned {
        /// Offending address.
        addr: u64,
        /// Watch size it would need to be aligned to.
        size: WatchSize,
    },
}

/// A supported watch length in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WatchSize {
    /// One byte.
    Bytes1,
    /// Two bytes.
    Bytes2,
    /// Four bytes.
    Bytes4,
    /// Eight bytes (x86-64 only encoding).
    Bytes8,
}

impl WatchSize {
    /// Validates a raw byte count.
    pub fn new(bytes: u64) -> Result<Self, WatchError> {
        match bytes {
            1 => Ok(Self::Bytes1),
            2 => Ok(Self::Bytes2),
            4 => Ok(Self::Bytes4),
            8 => Ok(Self::Bytes8),
            other => Err(WatchError::UnsupportedSize(other)),
        }
    }

    /// The length in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Self::Bytes1 => 1,
            Self::Bytes2 => 2,
            Self::Bytes4 => 4,
            Self::Bytes8 => 8,
        }
    }
}

impl fmt::Display for WatchSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// One watched range: an address and a size, aligned and immutable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchDescriptor {
    /// Watched address.
    pub addr: u64,
    /// Watched length.
    pub size: WatchSize,
}

impl WatchDescriptor {
    /// Validates alignment: the hardware only watches ranges aligned to
    /// their own size.
    pub fn new(addr: u64, size: WatchSize) -> Result<Self, WatchError> {
        if addr % size.bytes() != 0 {
            return Err(WatchError::Misaligned { addr, size });
        }
        Ok(WatchDescriptor { addr, size })
    }

    /// Mask selecting the watched bytes out of a machine word read at
    /// `addr`, for diagnostic logging of the post-write value.
    pub fn value_mask(self) -> u64 {
        match self.size {
            WatchSize::Bytes8 => u64::MAX,
            size => (1u64 << (size.bytes() * 8)) - 1,
        }
    }
}

/// The validated, immutable-after-init list of watch descriptors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchRegistry {
    watches: Vec<WatchDescriptor>,
}

impl WatchRegistry {
    /// Builds a registry, enforcing the 1..=4 descriptor limit. Descriptor
    /// order is slot order.
    pub fn new(watches: Vec<WatchDescriptor>) -> Result<Self, WatchError> {
        if watches.is_empty() {
            return Err(WatchError::Empty);
        }
        if watches.len() > MAX_WATCHPOINTS {
            return Err(WatchError::TooMany(watches.len()));
        }
        Ok(WatchRegistry { watches })
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Always false; a registry holds at least one descriptor.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Descriptors paired with their hardware slot index.
    pub fn slots(&self) -> impl Iterator<Item = (usize, WatchDescriptor)> + '_ {
        self.watches.iter().copied().enumerate()
    }

    /// The descriptor programmed into `slot`, if any.
    pub fn get(&self, slot: usize) -> Option<WatchDescriptor> {
        self.watches.get(slot).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(addr: u64, size: u64) -> WatchDescriptor {
        WatchDescriptor::new(addr, WatchSize::new(size).unwrap()).unwrap()
    }

    #[test]
    fn registry_caps_at_four() {
        let five = (0..5).map(|i| watch(0x1000 + i * 8, 4)).collect();
        assert_eq!(WatchRegistry::new(five), Err(WatchError::TooMany(5)));

        let four: Vec<_> = (0..4).map(|i| watch(0x1000 + i * 8, 4)).collect();
        let registry = WatchRegistry::new(four.clone()).unwrap();
        assert_eq!(registry.len(), 4);
        // slot order is registry order
        for (slot, desc) in registry.slots() {
            assert_eq!(desc, four[slot]);
        }
    }

    #[test]
    fn registry_rejects_empty() {
        assert_eq!(WatchRegistry::new(Vec::new()), Err(WatchError::Empty));
    }

    #[test]
    fn size_validation() {
        assert!(WatchSize::new(1).is_ok());
        assert!(WatchSize::new(2).is_ok());
        assert!(WatchSize::new(4).is_ok());
        assert!(WatchSize::new(8).is_ok());
        // no silent widening of odd sizes
        assert_eq!(WatchSize::new(3), Err(WatchError::UnsupportedSize(3)));
        assert_eq!(WatchSize::new(16), Err(WatchError::UnsupportedSize(16)));
        assert_eq!(WatchSize::new(0), Err(WatchError::UnsupportedSize(0)));
    }

    #[test]
    fn alignment_validation() {
        assert!(WatchDescriptor::new(0x5000, WatchSize::Bytes4).is_ok());
        assert!(WatchDescriptor::new(0x5001, WatchSize::Bytes1).is_ok());
        assert_eq!(
            WatchDescriptor::new(0x5002, WatchSize::Bytes4),
            Err(WatchError::Misaligned {
                addr: 0x5002,
                size: WatchSize::Bytes4
            })
        );
        assert_eq!(
            WatchDescriptor::new(0x5004, WatchSize::Bytes8),
            Err(WatchError::Misaligned {
                addr: 0x5004,
                size: WatchSize::Bytes8
            })
        );
    }

    #[test]
    fn value_masks() {
        assert_eq!(watch(0, 1).value_mask(), 0xff);
        assert_eq!(watch(0, 2).value_mask(), 0xffff);
        assert_eq!(watch(0, 4).value_mask(), 0xffff_ffff);
        assert_eq!(watch(0, 8).value_mask(), u64::MAX);
    }
}
