//! Control block layout and accessors.
//!
//! # Memory Layout
//!
//! ```text
//! offset  size  field
//! ──────  ────  ──────────────────────────────────────────────
//!      0     4  version     (i32 LE, written once by the creator)
//!      4     4  generation  (i32 LE, +1 per resize)
//!      8     4  capacity    (i32 LE, data segment size in bytes)
//!     12     1  primary active flag
//!     13     1  secondary active flag
//!     14     1  closed flag
//! ```
//!
//! The block is exactly 15 bytes. Every field is accessed through an atomic
//! view of the mapping so that polling observes the peer's stores and the
//! turn hand-off orders data writes.

use std::path::Path;
use std::sync::atomic::Ordering;

use static_assertions::const_assert_eq;

use crate::config::Side;
use crate::error::{Error, Result};
use crate::segment::MappedSegment;

/// Protocol version written by the creating endpoint.
pub const PROTOCOL_VERSION: i32 = 1;

/// Offset of the protocol version.
pub const VERSION_OFFSET: usize = 0;
/// Offset of the data segment generation.
pub const GENERATION_OFFSET: usize = 4;
/// Offset of the data segment capacity.
pub const CAPACITY_OFFSET: usize = 8;
/// Offset of the primary side's active flag.
pub const PRIMARY_ACTIVE_OFFSET: usize = 12;
/// Offset of the secondary side's active flag.
pub const SECONDARY_ACTIVE_OFFSET: usize = 13;
/// Offset of the closed flag.
pub const CLOSED_OFFSET: usize = 14;

/// Size of the control block in bytes.
pub const CONTROL_BLOCK_LEN: usize = 15;

/// Generation of the first data segment.
pub const INITIAL_GENERATION: i32 = 1;

const_assert_eq!(CONTROL_BLOCK_LEN, CLOSED_OFFSET + 1);
const_assert_eq!(CAPACITY_OFFSET + 4, PRIMARY_ACTIVE_OFFSET);

impl Side {
    /// Offset of the flag this side owns.
    pub const fn flag_offset(self) -> usize {
        match self {
            Side::Primary => PRIMARY_ACTIVE_OFFSET,
            Side::Secondary => SECONDARY_ACTIVE_OFFSET,
        }
    }
}

/// Plain copy of every control block field, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub version: i32,
    pub generation: i32,
    pub capacity: i32,
    pub primary_active: bool,
    pub secondary_active: bool,
    pub closed: bool,
}

impl std::fmt::Display for ControlSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{} gen={} capacity={} primary={} secondary={} closed={}",
            self.version,
            self.generation,
            self.capacity,
            self.primary_active,
            self.secondary_active,
            self.closed
        )
    }
}

/// The fixed-size metadata segment shared by both endpoints.
#[derive(Debug)]
pub struct ControlBlock {
    segment: MappedSegment,
}

impl ControlBlock {
    /// Create the control block for a new channel.
    ///
    /// The creator's own flag starts out set: it holds the first turn.
    pub fn create(path: impl AsRef<Path>, capacity: i32, side: Side) -> Result<Self> {
        let block = Self {
            segment: MappedSegment::create(path, CONTROL_BLOCK_LEN)?,
        };
        block.store_i32(VERSION_OFFSET, PROTOCOL_VERSION)?;
        block.set_generation(INITIAL_GENERATION)?;
        block.set_capacity(capacity)?;
        block.set_active(side, true)?;
        Ok(block)
    }

    /// Open the control block of an existing channel and check its version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let block = Self {
            segment: MappedSegment::open(path, CONTROL_BLOCK_LEN)?,
        };
        let found = block.version()?;
        if found != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found,
            });
        }
        Ok(block)
    }

    fn load_i32(&self, offset: usize) -> Result<i32> {
        // The mapping is page-aligned, so the cell value is the LE int32
        // on little-endian hosts; normalise for the others.
        let raw = self.segment.atomic_i32(offset)?.load(Ordering::Acquire);
        Ok(i32::from_le(raw))
    }

    fn store_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.segment
            .atomic_i32(offset)?
            .store(value.to_le(), Ordering::Release);
        Ok(())
    }

    fn load_flag(&self, offset: usize) -> Result<bool> {
        Ok(self.segment.atomic_u8(offset)?.load(Ordering::Acquire) != 0)
    }

    fn store_flag(&self, offset: usize, value: bool) -> Result<()> {
        self.segment
            .atomic_u8(offset)?
            .store(value as u8, Ordering::Release);
        Ok(())
    }

    /// Protocol version recorded by the creator.
    pub fn version(&self) -> Result<i32> {
        self.load_i32(VERSION_OFFSET)
    }

    /// Generation of the current data segment.
    pub fn generation(&self) -> Result<i32> {
        self.load_i32(GENERATION_OFFSET)
    }

    /// Record a new data segment generation.
    pub fn set_generation(&self, generation: i32) -> Result<()> {
        self.store_i32(GENERATION_OFFSET, generation)
    }

    /// Size in bytes of the current data segment.
    pub fn capacity(&self) -> Result<i32> {
        self.load_i32(CAPACITY_OFFSET)
    }

    /// Record the size of the current data segment.
    pub fn set_capacity(&self, capacity: i32) -> Result<()> {
        self.store_i32(CAPACITY_OFFSET, capacity)
    }

    /// Whether `side` currently holds the turn.
    pub fn is_active(&self, side: Side) -> Result<bool> {
        self.load_flag(side.flag_offset())
    }

    /// Set or clear the turn flag of `side`.
    pub fn set_active(&self, side: Side, active: bool) -> Result<()> {
        self.store_flag(side.flag_offset(), active)
    }

    /// Whether either side has closed the channel.
    pub fn is_closed(&self) -> Result<bool> {
        self.load_flag(CLOSED_OFFSET)
    }

    /// Set the closed flag. There is no way to clear it again.
    pub fn mark_closed(&self) -> Result<()> {
        self.store_flag(CLOSED_OFFSET, true)
    }

    /// Read every field at once.
    pub fn snapshot(&self) -> Result<ControlSnapshot> {
        Ok(ControlSnapshot {
            version: self.version()?,
            generation: self.generation()?,
            capacity: self.capacity()?,
            primary_active: self.is_active(Side::Primary)?,
            secondary_active: self.is_active(Side::Secondary)?,
            closed: self.is_closed()?,
        })
    }

    /// Path of the control file.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    /// Whether the control block is still mapped.
    pub fn is_open(&self) -> bool {
        self.segment.is_open()
    }

    /// Unmap the control block. The file stays on disk.
    pub fn close(&mut self) {
        self.segment.close();
    }

    /// Unmap the control block and remove its file.
    pub fn delete(&mut self) {
        self.segment.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn create_writes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");

        let block = ControlBlock::create(&path, 100, Side::Secondary).unwrap();
        assert_eq!(
            block.snapshot().unwrap(),
            ControlSnapshot {
                version: PROTOCOL_VERSION,
                generation: INITIAL_GENERATION,
                capacity: 100,
                primary_active: false,
                secondary_active: true,
                closed: false,
            }
        );

        // Byte-exact on disk, so other runtimes can read it.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), CONTROL_BLOCK_LEN);
        assert_eq!(&raw[0..4], &1i32.to_le_bytes());
        assert_eq!(&raw[4..8], &1i32.to_le_bytes());
        assert_eq!(&raw[8..12], &100i32.to_le_bytes());
        assert_eq!(&raw[12..15], &[0, 1, 0]);
    }

    #[test]
    fn open_sees_creator_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");

        let creator = ControlBlock::create(&path, 10, Side::Primary).unwrap();
        let joiner = ControlBlock::open(&path).unwrap();

        creator.set_generation(5).unwrap();
        creator.set_capacity(400).unwrap();
        creator.mark_closed().unwrap();

        assert_eq!(joiner.generation().unwrap(), 5);
        assert_eq!(joiner.capacity().unwrap(), 400);
        assert!(joiner.is_closed().unwrap());
        assert!(joiner.is_active(Side::Primary).unwrap());
    }

    #[test]
    fn open_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");

        let mut raw = [0u8; CONTROL_BLOCK_LEN];
        raw[0..4].copy_from_slice(&2i32.to_le_bytes());
        std::fs::write(&path, raw).unwrap();

        match ControlBlock::open(&path).unwrap_err() {
            Error::VersionMismatch { expected, found } => {
                assert_eq!((expected, found), (PROTOCOL_VERSION, 2))
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn open_rejects_truncated_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl");
        std::fs::write(&path, [1u8, 0, 0, 0]).unwrap();

        assert_eq!(
            ControlBlock::open(&path).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn flags_are_per_side() {
        let dir = tempfile::tempdir().unwrap();
        let block = ControlBlock::create(dir.path().join("ctl"), 1, Side::Primary).unwrap();

        block.set_active(Side::Secondary, true).unwrap();
        block.set_active(Side::Primary, false).unwrap();
        assert!(!block.is_active(Side::Primary).unwrap());
        assert!(block.is_active(Side::Secondary).unwrap());
    }

    #[test]
    fn closed_block_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = ControlBlock::create(dir.path().join("ctl"), 1, Side::Primary).unwrap();
        block.close();
        assert_eq!(block.generation().unwrap_err().kind(), ErrorKind::Closed);
    }
}
