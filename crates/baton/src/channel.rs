//! The turn-based channel.
//!
//! A [`Channel`] binds a [`ControlBlock`] and a [`DataSegment`] under one
//! name. Each endpoint owns one turn flag in the control block (see
//! [`Side`]) and only touches the data segment while its own flag is set.
//! Handing the turn over clears our flag and sets the peer's; waiting for it
//! to come back is a polling loop over the control block.
//!
//! # Turn hand-off
//!
//! ```text
//!   endpoint A (primary)                 endpoint B (secondary)
//!   ────────────────────                 ──────────────────────
//!   write data
//!   give_control(): primary=0, secondary=1
//!   wait_unblocked() ...                 wait_unblocked() returns
//!                                        read/write data
//!                                        give_control(): secondary=0, primary=1
//!   wait_unblocked() returns             wait_unblocked() ...
//! ```
//!
//! Flag loads are acquire and flag stores are release, so everything one
//! side wrote during its turn is visible to the other once it observes the
//! turn.
//!
//! # Resizing
//!
//! The data segment is grow-only. [`Channel::resize`] creates the next
//! generation's file, copies the old contents over and bumps `generation`
//! and `capacity` in the control block. The peer notices the new generation
//! the next time it waits and remaps. Superseded files stay on disk until
//! [`Namespace::delete_files`] collects them.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::{ChannelConfig, PollStrategy, Side};
use crate::control::{ControlBlock, ControlSnapshot, INITIAL_GENERATION};
use crate::data::DataSegment;
use crate::error::{Error, Result};
use crate::namespace::{Namespace, validate_name};

/// Where a channel is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// This endpoint holds the turn.
    Idle,
    /// The peer holds the turn.
    Blocked,
    /// This endpoint closed the channel.
    Closed,
    /// The channel was torn down after a timeout or after the peer closed it.
    Failed,
}

/// One endpoint of a two-party shared-memory channel.
pub struct Channel {
    name: String,
    namespace: Namespace,
    config: ChannelConfig,
    control: ControlBlock,
    data: DataSegment,
    last_seen_generation: i32,
    /// Set once the channel reaches `Closed` or `Failed`.
    terminal: Option<ChannelState>,
}

/// Convert a capacity to the int32 stored in the control block.
fn wire_capacity(capacity: usize) -> Result<i32> {
    match i32::try_from(capacity) {
        Ok(c) if c > 0 => Ok(c),
        _ => Err(Error::invalid(format!(
            "capacity {} must be between 1 and {}",
            capacity,
            i32::MAX
        ))),
    }
}

/// Convert a capacity read from the control block.
fn local_capacity(capacity: i32) -> Result<usize> {
    usize::try_from(capacity)
        .map_err(|_| Error::invalid(format!("control block holds capacity {}", capacity)))
}

impl Channel {
    /// Create or join the channel `name` in `namespace`, then wait until this
    /// endpoint holds the turn.
    ///
    /// The creating endpoint holds the first turn, so `new` returns
    /// immediately for it. A joining endpoint on the other [`Side`] blocks
    /// until the creator calls [`give_control`](Self::give_control).
    pub fn new(namespace: &Namespace, name: &str, config: ChannelConfig) -> Result<Self> {
        validate_name(name)?;
        let capacity = if config.create_new {
            wire_capacity(config.capacity)?
        } else {
            0
        };
        namespace.ensure()?;

        let control_path = namespace.control_path(name);
        let mut control = if config.create_new {
            ControlBlock::create(&control_path, capacity, config.side)?
        } else {
            ControlBlock::open(&control_path)?
        };

        let data = match Self::attach_data(namespace, name, &config, &control) {
            Ok(data) => data,
            Err(e) => {
                if config.create_new {
                    control.delete();
                }
                return Err(e);
            }
        };

        tracing::debug!(
            channel = name,
            side = ?config.side,
            created = config.create_new,
            generation = data.generation(),
            capacity = data.len(),
            "channel attached"
        );

        let mut channel = Self {
            name: name.to_owned(),
            namespace: namespace.clone(),
            last_seen_generation: data.generation(),
            config,
            control,
            data,
            terminal: None,
        };
        channel.wait_unblocked()?;
        Ok(channel)
    }

    /// Create the first data segment, or open the current one.
    ///
    /// A joiner attaches outside any turn, so the creator may be halfway
    /// through a resize: `generation` can already name a file that does not
    /// exist yet, and `capacity` can belong to a newer generation than the
    /// one read. The joiner therefore only requires its own minimum capacity
    /// and falls back to the previous generation, whose file is never
    /// removed by a resize. The first wait remaps to the current generation.
    fn attach_data(
        namespace: &Namespace,
        name: &str,
        config: &ChannelConfig,
        control: &ControlBlock,
    ) -> Result<DataSegment> {
        let generation = control.generation()?;
        if config.create_new {
            let recorded = local_capacity(control.capacity()?)?;
            return DataSegment::create(namespace, name, generation, recorded);
        }

        match DataSegment::open(namespace, name, generation, config.capacity) {
            Ok(data) => Ok(data),
            Err(e) if generation > INITIAL_GENERATION => {
                tracing::debug!(
                    channel = name,
                    generation,
                    error = %e,
                    "current generation not ready, attaching to the previous one"
                );
                DataSegment::open(namespace, name, generation - 1, config.capacity)
                    .map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the control block of `name` without joining the channel.
    pub fn inspect(namespace: &Namespace, name: &str) -> Result<ControlSnapshot> {
        validate_name(name)?;
        ControlBlock::open(namespace.control_path(name))?.snapshot()
    }

    /// Channel name, as passed to [`new`](Self::new).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which turn flag this endpoint owns.
    pub fn side(&self) -> Side {
        self.config.side
    }

    /// How long a wait may take before the channel is torn down.
    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Namespace the channel files live in.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Path of the control file.
    pub fn control_path(&self) -> &Path {
        self.control.path()
    }

    /// Path of the data segment this endpoint currently has mapped.
    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    /// Size of the data segment this endpoint currently has mapped.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Generation of the data segment this endpoint currently has mapped.
    pub fn generation(&self) -> i32 {
        self.last_seen_generation
    }

    /// Current control block contents.
    pub fn snapshot(&self) -> Result<ControlSnapshot> {
        self.control.snapshot()
    }

    /// Current handshake state, as seen from this endpoint.
    pub fn state(&self) -> ChannelState {
        if let Some(state) = self.terminal {
            return state;
        }
        match self.control.is_active(self.config.side) {
            Ok(true) => ChannelState::Idle,
            Ok(false) => ChannelState::Blocked,
            Err(_) => ChannelState::Closed,
        }
    }

    /// Whether the peer currently holds the turn.
    pub fn is_blocked(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(!self.control.is_active(self.config.side)?)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.terminal {
            None => Ok(()),
            Some(_) => Err(Error::Closed),
        }
    }

    /// Block until this endpoint holds the turn.
    ///
    /// Polls the control block without any OS wait primitive, so a blocked
    /// endpoint keeps a core busy unless a [`PollStrategy`] other than
    /// `Spin` is configured. With a timeout configured the clock is read
    /// every `check_interval` polls.
    ///
    /// On timeout, or when the peer has set the closed flag, the channel
    /// files are deleted before the error is returned. If the peer resized
    /// the data segment in the meantime, the new generation is mapped before
    /// returning.
    pub fn wait_unblocked(&mut self) -> Result<()> {
        self.ensure_live()?;
        let side = self.config.side;

        if !self.control.is_active(side)? {
            tracing::trace!(channel = %self.name, ?side, "waiting for turn");
            let started = Instant::now();
            let check_every = match self.config.poll {
                PollStrategy::Sleep(_) => 1,
                _ => self.config.check_interval.max(1),
            };
            let mut polls: u32 = 0;

            while !self.control.is_active(side)? && !self.control.is_closed()? {
                if let Some(timeout) = self.config.timeout {
                    polls = polls.wrapping_add(1);
                    if polls % check_every == 0 && started.elapsed() > timeout {
                        tracing::warn!(channel = %self.name, ?timeout, "peer did not return control");
                        self.fail();
                        return Err(Error::Timeout(timeout));
                    }
                }
                self.config.poll.pause();
            }
        }

        if self.control.is_closed()? {
            tracing::warn!(channel = %self.name, "peer closed the channel");
            self.fail();
            return Err(Error::PeerClosed);
        }

        self.catch_up()
    }

    /// Remap the data segment if the peer moved to a new generation.
    fn catch_up(&mut self) -> Result<()> {
        let generation = self.control.generation()?;
        if generation == self.last_seen_generation {
            return Ok(());
        }

        let capacity = local_capacity(self.control.capacity()?)?;
        let next = DataSegment::open(&self.namespace, &self.name, generation, capacity)?;
        let mut stale = std::mem::replace(&mut self.data, next);
        stale.close();

        tracing::debug!(
            channel = %self.name,
            from = self.last_seen_generation,
            to = generation,
            capacity,
            "followed peer resize"
        );
        self.last_seen_generation = generation;
        Ok(())
    }

    /// Hand the turn to the peer.
    ///
    /// With `wait`, block until the peer hands it back; otherwise return
    /// right away in [`ChannelState::Blocked`].
    pub fn give_control(&mut self, wait: bool) -> Result<()> {
        self.wait_unblocked()?;
        let side = self.config.side;
        self.control.set_active(side, false)?;
        self.control.set_active(side.peer(), true)?;
        tracing::trace!(channel = %self.name, ?side, "gave control");
        if wait {
            self.wait_unblocked()?;
        }
        Ok(())
    }

    /// Clear our own turn flag without handing the turn over.
    ///
    /// # Safety
    ///
    /// This bypasses the handshake. The caller must make sure the two
    /// endpoints never access the data segment at the same time afterwards,
    /// since concurrent access to the mapping is a data race.
    pub unsafe fn signal_self_blocked(&self) -> Result<()> {
        self.ensure_live()?;
        self.control.set_active(self.config.side, false)
    }

    /// Set the peer's turn flag without clearing ours.
    ///
    /// # Safety
    ///
    /// Same contract as [`signal_self_blocked`](Self::signal_self_blocked):
    /// both endpoints may consider themselves active afterwards.
    pub unsafe fn signal_peer_unblocked(&self) -> Result<()> {
        self.ensure_live()?;
        self.control.set_active(self.config.side.peer(), true)
    }

    /// Grow the data segment to `capacity` bytes.
    ///
    /// Shrinking is rejected. The existing contents are carried over; the
    /// peer picks up the new segment on its next wait.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        self.wait_unblocked()?;

        let new_capacity = wire_capacity(capacity)?;
        let current = self.control.capacity()?;
        if new_capacity < current {
            return Err(Error::invalid(format!(
                "cannot shrink channel from {} to {} bytes",
                current, capacity
            )));
        }

        let generation = self.data.generation();
        let next_generation = generation
            .checked_add(1)
            .ok_or_else(|| Error::invalid("generation counter exhausted"))?;

        self.control.set_generation(next_generation)?;
        let next = match self.data.grow(
            &self.namespace,
            &self.name,
            capacity,
            local_capacity(current)?,
        ) {
            Ok(next) => next,
            Err(e) => {
                let _ = self.control.set_generation(generation);
                return Err(e);
            }
        };
        self.control.set_capacity(new_capacity)?;

        let mut stale = std::mem::replace(&mut self.data, next);
        stale.close();
        self.last_seen_generation = next_generation;

        tracing::debug!(
            channel = %self.name,
            generation = next_generation,
            from = current,
            to = capacity,
            "resized channel"
        );
        Ok(())
    }

    /// Set the closed flag and unmap both segments. Files stay on disk.
    ///
    /// Safe to call more than once and after a failure.
    pub fn close(&mut self) {
        if self.terminal.is_none() {
            // The control block may already be unmapped; nothing to signal then.
            let _ = self.control.mark_closed();
            self.terminal = Some(ChannelState::Closed);
            tracing::debug!(channel = %self.name, "closed channel");
        }
        self.control.close();
        self.data.close();
    }

    /// Close the channel and remove its control and data files.
    ///
    /// Safe to call more than once.
    pub fn delete(&mut self) {
        self.close();
        self.control.delete();
        self.data.delete();
    }

    /// Tear down after a timeout or peer closure.
    fn fail(&mut self) {
        self.delete();
        self.terminal = Some(ChannelState::Failed);
    }

    /// Wrap the channel so it is deleted when the guard goes out of scope.
    pub fn delete_on_drop(self) -> DeleteOnDrop {
        DeleteOnDrop(self)
    }

    /// Wait for the turn, then read a little-endian int32 at `offset`.
    ///
    /// Returns the value and the offset just past it, like every typed
    /// accessor below.
    pub fn read_i32(&mut self, offset: usize) -> Result<(i32, usize)> {
        self.wait_unblocked()?;
        self.data.read_i32(offset)
    }

    /// Wait for the turn, then read a one-byte bool.
    pub fn read_bool(&mut self, offset: usize) -> Result<(bool, usize)> {
        self.wait_unblocked()?;
        self.data.read_bool(offset)
    }

    /// Wait for the turn, then read `len` raw bytes.
    pub fn read_bytes(&mut self, offset: usize, len: usize) -> Result<(Vec<u8>, usize)> {
        self.wait_unblocked()?;
        self.data.read_bytes(offset, len)
    }

    /// Wait for the turn, then read a little-endian float32.
    pub fn read_f32(&mut self, offset: usize) -> Result<(f32, usize)> {
        self.wait_unblocked()?;
        self.data.read_f32(offset)
    }

    /// Read an int32 length followed by that many ASCII bytes.
    pub fn read_string(&mut self, offset: usize) -> Result<(String, usize)> {
        self.wait_unblocked()?;
        let (len, offset) = self.data.read_i32(offset)?;
        let len = usize::try_from(len)
            .map_err(|_| Error::invalid(format!("negative string length {}", len)))?;
        let (bytes, next) = self.data.read_bytes(offset, len)?;
        if !bytes.is_ascii() {
            return Err(Error::invalid(format!("string at {} is not ASCII", offset)));
        }
        let value = String::from_utf8(bytes).map_err(|e| Error::invalid(e.to_string()))?;
        Ok((value, next))
    }

    /// Wait for the turn, then write a little-endian int32.
    pub fn write_i32(&mut self, offset: usize, value: i32) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_i32(offset, value)
    }

    /// Wait for the turn, then write a bool as `0`/`1`.
    pub fn write_bool(&mut self, offset: usize, value: bool) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_bool(offset, value)
    }

    /// Wait for the turn, then write raw bytes.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_bytes(offset, data)
    }

    /// Wait for the turn, then write a little-endian float32.
    pub fn write_f32(&mut self, offset: usize, value: f32) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_f32(offset, value)
    }

    /// Write `value` as an int32 length followed by its ASCII bytes.
    ///
    /// Nothing is written if the encoded string does not fit.
    pub fn write_string(&mut self, offset: usize, value: &str) -> Result<usize> {
        if !value.is_ascii() {
            return Err(Error::invalid("only ASCII strings can be written"));
        }
        let len = i32::try_from(value.len())
            .map_err(|_| Error::invalid("string is too long for an int32 length"))?;
        self.wait_unblocked()?;

        let encoded = 4 + value.len();
        if offset.checked_add(encoded).is_none_or(|end| end > self.data.len()) {
            return Err(Error::OutOfBounds {
                offset,
                len: encoded,
                capacity: self.data.len(),
            });
        }
        let offset = self.data.write_i32(offset, len)?;
        self.data.write_bytes(offset, value.as_bytes())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("side", &self.config.side)
            .field("generation", &self.last_seen_generation)
            .field("capacity", &self.data.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Deletes the wrapped channel when dropped.
#[derive(Debug)]
pub struct DeleteOnDrop(Channel);

impl Deref for DeleteOnDrop {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.0
    }
}

impl DerefMut for DeleteOnDrop {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.0
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        self.0.delete();
    }
}
