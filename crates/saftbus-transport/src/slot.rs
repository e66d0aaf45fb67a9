//! Numbered connection slots.
//!
//! A server listens on `<base>00` .. `<base>NN`; every connection occupies
//! exactly one slot for its lifetime. The slot number is also folded into
//! proxy ids, so it is bounded by [`MAX_SLOTS`].

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// Upper bound on the number of slots a server may expose.
pub const MAX_SLOTS: usize = 100;

/// Socket base name used when none is configured.
pub const DEFAULT_SOCKET_BASE: &str = "/tmp/saftbus_";

/// Index of a connection slot, always below [`MAX_SLOTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u8);

impl SlotId {
    /// Validate and wrap a slot index.
    pub fn new(index: usize) -> Result<Self> {
        if index >= MAX_SLOTS {
            return Err(TransportError::SlotOutOfRange {
                slot: index,
                max: MAX_SLOTS - 1,
            });
        }
        Ok(Self(index as u8))
    }

    /// The numeric slot index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Iterate over the first `count` slots in ascending order.
    pub fn range(count: usize) -> impl Iterator<Item = SlotId> {
        (0..count.min(MAX_SLOTS)).map(|i| SlotId(i as u8))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Build the socket path for `slot`: the base name followed by a two-digit suffix.
pub fn slot_path(base: impl AsRef<Path>, slot: SlotId) -> PathBuf {
    let mut path = base.as_ref().as_os_str().to_os_string();
    path.push(slot.to_string());
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_paths_are_zero_padded() {
        let base = "/tmp/saftbus_";
        assert_eq!(
            slot_path(base, SlotId::new(0).unwrap()),
            PathBuf::from("/tmp/saftbus_00")
        );
        assert_eq!(
            slot_path(base, SlotId::new(7).unwrap()),
            PathBuf::from("/tmp/saftbus_07")
        );
        assert_eq!(
            slot_path(base, SlotId::new(99).unwrap()),
            PathBuf::from("/tmp/saftbus_99")
        );
    }

    #[test]
    fn slot_out_of_range_rejected() {
        let err = SlotId::new(MAX_SLOTS).unwrap_err();
        assert!(matches!(err, TransportError::SlotOutOfRange { slot: 100, .. }));
    }

    #[test]
    fn range_is_capped() {
        assert_eq!(SlotId::range(3).map(SlotId::index).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(SlotId::range(500).count(), MAX_SLOTS);
    }
}
