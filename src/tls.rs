//! TLS record layer plumbing
//!
//! Cryptography is not done here. A [`TlsRecordEngine`] (supplied by the
//! caller, typically backed by a TLS library) turns plaintext into records and
//! back; this module owns the buffer management around it:
//!
//! - [`unwrap_records`] feeds received network bytes to the engine. An
//!   undersized plaintext buffer is grown (doubling, capped at the engine's
//!   advertised application buffer size); a partial record leaves the unread
//!   bytes compacted at the head of the network buffer until more arrive.
//! - [`wrap_records`] encrypts queued plaintext into the network write buffer.
//! - [`drive_handshake`] steps the engine through its handshake.
//!
//! Engine errors are never retried: a record that failed once cannot be
//! replayed safely, so every [`TlsError`] is fatal to the session.

use crate::buffer_pool::PooledBuffer;
use crate::error::TlsError;

/// Outcome class of one engine call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// Destination too small for the next record
    BufferOverflow,
    /// Source holds only part of a record
    BufferUnderflow,
    /// The engine (or the peer) closed the record stream
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    /// Bytes read from the source slice
    pub consumed: usize,
    /// Bytes written to the destination slice
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self { status, consumed, produced }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Waiting for handshake records from the peer
    NeedUnwrap,
    /// Has handshake records to send
    NeedWrap,
    Complete,
}

/// Stateful record engine for one connection
pub trait TlsRecordEngine: Send {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Stop producing outbound records (sends close_notify if the engine
    /// supports it)
    fn close_outbound(&mut self);

    /// Largest record the engine emits or accepts
    fn packet_buffer_size(&self) -> usize;

    /// Largest plaintext a single record can expand to
    fn application_buffer_size(&self) -> usize;
}

/// Creates an engine per accepted or connected stream
pub trait TlsEngineFactory: Send + Sync + 'static {
    fn create(&self, client_mode: bool) -> Result<Box<dyn TlsRecordEngine>, TlsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwrapped {
    /// All complete records were consumed; wait for more network bytes
    NeedInput,
    /// The plaintext buffer holds unread data and no free space; drain it and
    /// call again
    Drain,
    /// Peer closed the record stream
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapped {
    /// All plaintext became ciphertext
    Done,
    /// The network buffer is full of unsent ciphertext; flush and call again
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Complete,
    /// Waiting on peer records
    NeedInput,
    /// Network write buffer must be flushed before the engine can go on
    Flush,
}

/// Grows `buf` by doubling, never past `max`.
pub fn grow_buffer(buf: &mut PooledBuffer, max: usize, which: &'static str) -> Result<(), TlsError> {
    let cap = buf.capacity();
    if cap >= max {
        return Err(TlsError::BufferLimit { which, max });
    }
    let next = (cap * 2).max(cap + 1).min(max);
    log::debug!("growing {} buffer {} -> {}", which, cap, next);
    buf.resize(next);
    Ok(())
}

/// Unwraps every complete record in `net` into `app`.
pub fn unwrap_records(
    engine: &mut dyn TlsRecordEngine,
    net: &mut PooledBuffer,
    app: &mut PooledBuffer,
) -> Result<Unwrapped, TlsError> {
    loop {
        if net.is_empty() {
            return Ok(Unwrapped::NeedInput);
        }
        let res = engine.unwrap(net.readable(), app.writable())?;
        net.consume(res.consumed);
        app.fill(res.produced);
        match res.status {
            EngineStatus::Ok => {
                if res.consumed == 0 && res.produced == 0 {
                    return Ok(Unwrapped::NeedInput);
                }
            }
            EngineStatus::BufferOverflow => {
                let free = app.remaining_mut();
                app.compact();
                if app.remaining_mut() > free {
                    continue;
                }
                if !app.is_empty() {
                    return Ok(Unwrapped::Drain);
                }
                grow_buffer(app, engine.application_buffer_size(), "application")?;
            }
            EngineStatus::BufferUnderflow => {
                make_room_for_input(net, engine.packet_buffer_size())?;
                return Ok(Unwrapped::NeedInput);
            }
            EngineStatus::Closed => return Ok(Unwrapped::Closed),
        }
    }
}

/// Wraps the readable bytes of `plain` into `net`.
pub fn wrap_records(
    engine: &mut dyn TlsRecordEngine,
    plain: &mut PooledBuffer,
    net: &mut PooledBuffer,
) -> Result<Wrapped, TlsError> {
    while !plain.is_empty() {
        net.compact();
        // a record is only wrapped into a packet-sized gap
        if !net.is_empty() && net.remaining_mut() < engine.packet_buffer_size() {
            return Ok(Wrapped::Flush);
        }
        let res = engine.wrap(plain.readable(), net.writable())?;
        plain.consume(res.consumed);
        net.fill(res.produced);
        match res.status {
            EngineStatus::Ok => {
                if res.consumed == 0 && res.produced == 0 {
                    return Err(TlsError::BadRecord("wrap made no progress".into()));
                }
            }
            EngineStatus::BufferOverflow => {
                if !net.is_empty() {
                    return Ok(Wrapped::Flush);
                }
                grow_buffer(net, engine.packet_buffer_size(), "network write")?;
            }
            EngineStatus::BufferUnderflow => {
                return Err(TlsError::BadRecord("underflow while wrapping".into()));
            }
            EngineStatus::Closed => return Err(TlsError::Closed),
        }
    }
    Ok(Wrapped::Done)
}

/// Advances the handshake as far as buffered input and output space allow.
///
/// Application bytes the engine releases during the handshake land in `app`
/// and are delivered once the session is running.
pub fn drive_handshake(
    engine: &mut dyn TlsRecordEngine,
    net_in: &mut PooledBuffer,
    app: &mut PooledBuffer,
    net_out: &mut PooledBuffer,
) -> Result<HandshakeStep, TlsError> {
    loop {
        match engine.handshake_status() {
            HandshakeStatus::Complete => return Ok(HandshakeStep::Complete),
            HandshakeStatus::NeedUnwrap => {
                if net_in.is_empty() {
                    return Ok(HandshakeStep::NeedInput);
                }
                let res = engine.unwrap(net_in.readable(), app.writable())?;
                net_in.consume(res.consumed);
                app.fill(res.produced);
                match res.status {
                    EngineStatus::Ok => {
                        if res.consumed == 0 && res.produced == 0 {
                            return Ok(HandshakeStep::NeedInput);
                        }
                    }
                    EngineStatus::BufferUnderflow => {
                        make_room_for_input(net_in, engine.packet_buffer_size())?;
                        return Ok(HandshakeStep::NeedInput);
                    }
                    EngineStatus::BufferOverflow => {
                        app.compact();
                        grow_buffer(app, engine.application_buffer_size(), "application")?;
                    }
                    EngineStatus::Closed => {
                        return Err(TlsError::Handshake("peer closed during handshake".into()));
                    }
                }
            }
            HandshakeStatus::NeedWrap => {
                net_out.compact();
                let res = engine.wrap(&[], net_out.writable())?;
                net_out.fill(res.produced);
                match res.status {
                    EngineStatus::Ok => {
                        if res.produced == 0
                            && engine.handshake_status() == HandshakeStatus::NeedWrap
                        {
                            return Err(TlsError::Handshake("wrap made no progress".into()));
                        }
                    }
                    EngineStatus::BufferOverflow => {
                        if !net_out.is_empty() {
                            return Ok(HandshakeStep::Flush);
                        }
                        grow_buffer(net_out, engine.packet_buffer_size(), "network write")?;
                    }
                    EngineStatus::BufferUnderflow => {
                        return Err(TlsError::Handshake("underflow while wrapping".into()));
                    }
                    EngineStatus::Closed => {
                        return Err(TlsError::Handshake("engine closed during handshake".into()));
                    }
                }
            }
        }
    }
}

/// Keeps the partial record at the head of `net`, growing the buffer when the
/// record cannot fit.
fn make_room_for_input(net: &mut PooledBuffer, max: usize) -> Result<(), TlsError> {
    net.compact();
    if net.is_full() {
        grow_buffer(net, max, "network read")?;
    }
    Ok(())
}
