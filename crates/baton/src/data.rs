//! The payload segment of a channel.
//!
//! A data segment never changes size. Growing the channel replaces it with a
//! new file one generation later; see [`Channel::resize`].
//!
//! [`Channel::resize`]: crate::Channel::resize

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use crate::control::INITIAL_GENERATION;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::segment::MappedSegment;

/// Data file path for `generation`. Generations start at 1; anything lower
/// would name the control file.
fn path(ns: &Namespace, name: &str, generation: i32) -> Result<PathBuf> {
    if generation < INITIAL_GENERATION {
        return Err(Error::invalid(format!(
            "data segment generation {} is not positive",
            generation
        )));
    }
    Ok(ns.data_path(name, generation))
}

/// A [`MappedSegment`] tagged with the generation it belongs to.
#[derive(Debug)]
pub struct DataSegment {
    generation: i32,
    segment: MappedSegment,
}

impl DataSegment {
    /// Create the data file for `generation`.
    pub fn create(ns: &Namespace, name: &str, generation: i32, capacity: usize) -> Result<Self> {
        Ok(Self {
            generation,
            segment: MappedSegment::create(path(ns, name, generation)?, capacity)?,
        })
    }

    /// Open the data file for `generation`, requiring at least `capacity`
    /// bytes.
    pub fn open(ns: &Namespace, name: &str, generation: i32, capacity: usize) -> Result<Self> {
        Ok(Self {
            generation,
            segment: MappedSegment::open(path(ns, name, generation)?, capacity)?,
        })
    }

    /// Create the next generation at `capacity` bytes, carrying over the
    /// first `carry` bytes of this one.
    pub fn grow(&self, ns: &Namespace, name: &str, capacity: usize, carry: usize) -> Result<Self> {
        let generation = self
            .generation
            .checked_add(1)
            .ok_or_else(|| Error::invalid("generation counter exhausted"))?;
        let mut next = Self::create(ns, name, generation, capacity)?;
        if let Err(e) = next.segment.copy_prefix_from(&self.segment, carry) {
            next.segment.delete();
            return Err(e);
        }
        Ok(next)
    }

    /// Generation this segment was created for.
    pub fn generation(&self) -> i32 {
        self.generation
    }
}

impl Deref for DataSegment {
    type Target = MappedSegment;

    fn deref(&self) -> &MappedSegment {
        &self.segment
    }
}

impl DerefMut for DataSegment {
    fn deref_mut(&mut self) -> &mut MappedSegment {
        &mut self.segment
    }
}
