// OTA engine - streams an image from a session into the inactive partition
//
// Stream layout after ACK: <size> payload bytes, then the CRC-32 of the payload
// as 4 little-endian bytes. The boot target changes only after the trailer
// matches; every failure before that leaves the running image in charge.

use std::convert::Infallible;
use std::io::{self, ErrorKind, Read};
use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{IMAGE_CRC, TRAILER_LEN};
use crate::slots::{BootSlots, ImageWriter, SlotError};

/// Bytes moved from the socket to flash per write.
pub const CHUNK_SIZE: usize = 1024;

/// Longest silence tolerated in the middle of a transfer.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(8);

const PROGRESS_STEP: u64 = 64 * 1024;

/// Byte source of a firmware transfer.
pub trait Transfer: Read {
    /// Bound every read; `None` blocks indefinitely.
    fn set_stall_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transfer for TcpStream {
    fn set_stall_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

impl<T: Transfer + ?Sized> Transfer for &mut T {
    fn set_stall_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_stall_timeout(timeout)
    }
}

/// How a failed update should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble; the sender may simply retry.
    Transient,
    /// The image arrived but is not trustworthy.
    Integrity,
    /// No partition, or the image does not fit or cannot be written.
    Resource,
    /// Boot metadata may be inconsistent; the device restarts.
    Fatal,
}

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("another update is in progress")]
    Busy,
    #[error("no update partition available")]
    NoPartition,
    #[error("image size {size} not accepted")]
    InvalidSize { size: u32 },
    #[error("no data for {timeout:?} after {received} of {expected} bytes")]
    Stalled {
        received: u64,
        expected: u64,
        timeout: Duration,
    },
    #[error("peer closed after {received} of {expected} bytes")]
    Closed { received: u64, expected: u64 },
    #[error("receive failed after {received} bytes: {source}")]
    Io {
        received: u64,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch (calculated {calculated:08X}, sent {sent:08X})")]
    Integrity { calculated: u32, sent: u32 },
    #[error("image rejected by bootloader validation")]
    Rejected,
    #[error("flash write failed: {0}")]
    Flash(#[source] SlotError),
    #[error("could not select new boot image: {0}")]
    Finalize(#[source] SlotError),
}

impl OtaError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OtaError::Busy
            | OtaError::Stalled { .. }
            | OtaError::Closed { .. }
            | OtaError::Io { .. } => FailureKind::Transient,
            OtaError::Integrity { .. } | OtaError::Rejected => FailureKind::Integrity,
            OtaError::NoPartition | OtaError::InvalidSize { .. } | OtaError::Flash(_) => {
                FailureKind::Resource
            }
            OtaError::Finalize(_) => FailureKind::Fatal,
        }
    }

    /// Code sent to the peer as `ERR <code>`.
    pub fn code(&self) -> &'static str {
        match self {
            OtaError::Busy => "BUSY",
            OtaError::NoPartition => "NOPART",
            OtaError::InvalidSize { .. } => "SIZE",
            OtaError::Stalled { .. } => "STALL",
            OtaError::Closed { .. } => "CLOSED",
            OtaError::Io { .. } => "IO",
            OtaError::Integrity { .. } => "CRC",
            OtaError::Rejected => "REJECTED",
            OtaError::Flash(_) => "FLASH",
            OtaError::Finalize(_) => "FINALIZE",
        }
    }
}

/// Outcome of a verified and activated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub partition: String,
    pub size: u32,
    pub crc: u32,
}

/// Receives images into the boot slots. One update at a time.
pub struct OtaEngine<S: BootSlots> {
    slots: Mutex<S>,
    stall_timeout: Duration,
}

impl<S: BootSlots> OtaEngine<S> {
    pub fn new(slots: S) -> Self {
        Self {
            slots: Mutex::new(slots),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Receive and activate an image, then restart into it.
    ///
    /// Returns only on failure; the running image stays the boot target
    /// unless the failure is [`FailureKind::Fatal`].
    pub fn perform<T: Transfer + ?Sized>(
        &self,
        source: &mut T,
        claimed_size: u32,
    ) -> Result<Infallible, OtaError> {
        let mut slots = self.acquire()?;
        let installed = receive(&mut *slots, source, claimed_size, self.stall_timeout)?;
        log::info!(
            "OTA OK: {} bytes into {} (crc {:08X}), restarting",
            installed.size,
            installed.partition,
            installed.crc
        );
        slots.restart()
    }

    /// Receive and activate an image without restarting.
    pub fn install<T: Transfer + ?Sized>(
        &self,
        source: &mut T,
        claimed_size: u32,
    ) -> Result<Installed, OtaError> {
        let mut slots = self.acquire()?;
        receive(&mut *slots, source, claimed_size, self.stall_timeout)
    }

    /// Restart the device regardless of a running update.
    pub fn restart(&self) -> ! {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.restart()
    }

    fn acquire(&self) -> Result<MutexGuard<'_, S>, OtaError> {
        match self.slots.try_lock() {
            Ok(guard) => Ok(guard),
            // A previous holder unwound; the slots hold no half-done state
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(OtaError::Busy),
        }
    }
}

fn receive<S, T>(
    slots: &mut S,
    source: &mut T,
    claimed_size: u32,
    stall_timeout: Duration,
) -> Result<Installed, OtaError>
where
    S: BootSlots,
    T: Transfer + ?Sized,
{
    if claimed_size == 0 {
        return Err(OtaError::InvalidSize { size: 0 });
    }

    let mut writer = slots.begin_update(claimed_size).map_err(|e| match e {
        SlotError::NoPartition => OtaError::NoPartition,
        SlotError::TooLarge { size, capacity } => {
            log::warn!("OTA: {size} bytes exceed partition of {capacity} bytes");
            OtaError::InvalidSize { size }
        }
        other => OtaError::Flash(other),
    })?;

    log::info!(
        "OTA: receiving {} bytes into {} ({} bytes free)",
        claimed_size,
        writer.label(),
        writer.capacity()
    );

    let received = source
        .set_stall_timeout(Some(stall_timeout))
        .map_err(|source| OtaError::Io {
            received: 0,
            source,
        })
        .and_then(|()| stream_image(&mut writer, source, claimed_size, stall_timeout));

    let crc = match received {
        Ok(crc) => crc,
        Err(err) => {
            if let Err(abort_err) = writer.abort() {
                log::warn!("OTA: abort after failed transfer also failed: {abort_err}");
            }
            return Err(err);
        }
    };

    let partition = writer.label().to_owned();
    writer.complete().map_err(|e| match e {
        SlotError::Rejected => OtaError::Rejected,
        other => OtaError::Finalize(other),
    })?;

    Ok(Installed {
        partition,
        size: claimed_size,
        crc,
    })
}

/// Copy the payload into `writer` and check it against the trailer.
fn stream_image<W, T>(
    writer: &mut W,
    source: &mut T,
    claimed_size: u32,
    stall_timeout: Duration,
) -> Result<u32, OtaError>
where
    W: ImageWriter,
    T: Transfer + ?Sized,
{
    let payload = u64::from(claimed_size);
    let expected = payload + TRAILER_LEN as u64;
    let mut digest = IMAGE_CRC.digest();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut received = 0u64;
    let mut next_report = PROGRESS_STEP;

    while received < payload {
        let want = (payload - received).min(CHUNK_SIZE as u64) as usize;
        let n = read_some(source, &mut chunk[..want], received, expected, stall_timeout)?;
        digest.update(&chunk[..n]);
        writer.write(&chunk[..n]).map_err(OtaError::Flash)?;
        received += n as u64;

        if received >= next_report {
            log::debug!("OTA: {}% ({received}/{payload})", received * 100 / payload);
            next_report += PROGRESS_STEP;
        }
    }

    let calculated = digest.finalize();

    let mut trailer = [0u8; TRAILER_LEN];
    let mut filled = 0;
    while filled < TRAILER_LEN {
        filled += read_some(
            source,
            &mut trailer[filled..],
            received + filled as u64,
            expected,
            stall_timeout,
        )?;
    }

    let sent = u32::from_le_bytes(trailer);
    if sent != calculated {
        return Err(OtaError::Integrity { calculated, sent });
    }
    Ok(calculated)
}

fn read_some<T: Transfer + ?Sized>(
    source: &mut T,
    buf: &mut [u8],
    received: u64,
    expected: u64,
    timeout: Duration,
) -> Result<usize, OtaError> {
    loop {
        match source.read(buf) {
            Ok(0) => return Err(OtaError::Closed { received, expected }),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(OtaError::Stalled {
                    received,
                    expected,
                    timeout,
                })
            }
            Err(source) => return Err(OtaError::Io { received, source }),
        }
    }
}
