// Session dispatcher - turns protocol lines into replies and bus commands

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::CommandBus;
use crate::command::Command;
use crate::line::{LineBuffer, LineError};
use crate::ota::{FailureKind, OtaEngine, OtaError, Transfer};
use crate::protocol::{OtaHeader, Reply, Request};
use crate::slots::BootSlots;

/// Full-duplex byte stream a session runs on.
pub trait Connection: Transfer + Write {}

impl<T: Transfer + Write + ?Sized> Connection for T {}

/// Why a session ended without an I/O error.
#[derive(Debug)]
pub enum SessionEnd {
    PeerClosed,
    /// The update after `ACK` failed; the stream is no longer line-aligned.
    UpdateFailed(OtaError),
}

pub struct Dispatcher<S: BootSlots> {
    bus: Arc<CommandBus>,
    ota: Arc<OtaEngine<S>>,
    auth_token: String,
}

impl<S: BootSlots> Dispatcher<S> {
    pub fn new(bus: Arc<CommandBus>, ota: Arc<OtaEngine<S>>, auth_token: impl Into<String>) -> Self {
        Self {
            bus,
            ota,
            auth_token: auth_token.into(),
        }
    }

    /// Run one session until the peer closes, an update fails or I/O breaks.
    ///
    /// A successful update restarts the device and never returns here.
    pub fn serve<C: Connection + ?Sized>(&self, conn: &mut C, peer: &str) -> io::Result<SessionEnd> {
        let mut lines = LineBuffer::new();

        loop {
            while let Some(line) = lines.pop_line() {
                let request = match &line {
                    Ok(text) => Request::parse_bytes(text),
                    Err(LineError::TooLong) => {
                        log::warn!("{peer}: overlong line dropped");
                        Request::Unknown
                    }
                };

                if let Request::Ota(header) = request {
                    let err = self.update(conn, &mut lines, header, peer)?;
                    return Ok(SessionEnd::UpdateFailed(err));
                }

                log::debug!("{peer}: {request:?}");
                self.respond(request).write_to(conn)?;
            }

            if lines.fill_from(conn)? == 0 {
                return Ok(SessionEnd::PeerClosed);
            }
        }
    }

    fn respond(&self, request: Request<'_>) -> Reply {
        match request {
            Request::Ping => Reply::Pong,
            // Advisory only; nothing is gated on the outcome
            Request::Auth(token) if token == self.auth_token => Reply::Ok,
            Request::Auth(_) => Reply::Denied,
            Request::LedOn => {
                self.post(Command::LedOn);
                Reply::LedOn
            }
            Request::LedOff => {
                self.post(Command::LedOff);
                Reply::LedOff
            }
            Request::BadOta => Reply::BadFormat,
            Request::Ota(_) | Request::Unknown => Reply::What,
        }
    }

    fn post(&self, cmd: Command) {
        if let Err(e) = self.bus.send(cmd, Duration::ZERO) {
            log::warn!("{e}");
        }
    }

    fn update<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        lines: &mut LineBuffer,
        header: OtaHeader,
        peer: &str,
    ) -> io::Result<OtaError> {
        log::info!(
            "{peer}: OTA requested, {} bytes (announced crc {:08X})",
            header.size,
            header.crc
        );
        Reply::Ack.write_to(conn)?;
        self.post(Command::OtaStart);

        let early = lines.take_pending();
        let outcome = {
            let mut source = Spill::new(&early, &mut *conn);
            self.ota.perform(&mut source, header.size)
        };
        let err = match outcome {
            Ok(never) => match never {},
            Err(err) => err,
        };

        log::error!("{peer}: OTA failed: {err} ({:?})", err.kind());
        if let Err(e) = Reply::Error(err.code()).write_to(conn) {
            log::debug!("{peer}: could not report failure: {e}");
        }

        if err.kind() == FailureKind::Fatal {
            log::error!("Boot metadata may be inconsistent, restarting");
            self.ota.restart();
        }
        Ok(err)
    }
}

/// Bytes buffered behind the header line, then the connection itself.
struct Spill<'a, C: ?Sized> {
    early: &'a [u8],
    conn: &'a mut C,
}

impl<'a, C: ?Sized> Spill<'a, C> {
    fn new(early: &'a [u8], conn: &'a mut C) -> Self {
        Self { early, conn }
    }
}

impl<C: Read + ?Sized> Read for Spill<'_, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.early.is_empty() {
            return self.conn.read(buf);
        }
        let n = self.early.read(buf)?;
        Ok(n)
    }
}

impl<C: Transfer + ?Sized> Transfer for Spill<'_, C> {
    fn set_stall_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.conn.set_stall_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::image_checksum;
    use crate::slots::{MemorySlots, RestartRequested};
    use std::panic::{self, AssertUnwindSafe};

    /// Scripted peer: reads come from `input`, replies collect in `output`.
    struct Peer {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Peer {
        fn new(input: &[u8]) -> Self {
            Self {
                input: io::Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }

        fn replies(&self) -> String {
            String::from_utf8_lossy(&self.output).into_owned()
        }
    }

    impl Read for Peer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Peer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transfer for Peer {
        fn set_stall_timeout(&mut self, _: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn dispatcher(slots: &MemorySlots) -> (Dispatcher<MemorySlots>, Arc<CommandBus>) {
        let bus = Arc::new(CommandBus::new());
        let ota = Arc::new(OtaEngine::new(slots.clone()));
        (Dispatcher::new(Arc::clone(&bus), ota, "hunter2"), bus)
    }

    #[test]
    fn test_command_lines_get_replies() {
        let slots = MemorySlots::new(1024);
        let (dispatcher, bus) = dispatcher(&slots);
        let mut peer = Peer::new(b"PING\nAUTH wrong\nAUTH hunter2\nled_on\nFOO\nled_off\nOTA 5\n");

        let end = dispatcher.serve(&mut peer, "test").unwrap();

        assert!(matches!(end, SessionEnd::PeerClosed));
        assert_eq!(
            peer.replies(),
            "PONG\nDENIED\nOK\nled_on\nWHAT?\nled_off\nBADFMT\n"
        );
        assert_eq!(bus.receive(Duration::ZERO), Ok(Command::LedOn));
        assert_eq!(bus.receive(Duration::ZERO), Ok(Command::LedOff));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_led_reply_is_sent_even_when_bus_is_full() {
        let slots = MemorySlots::new(1024);
        let (dispatcher, bus) = dispatcher(&slots);
        for _ in 0..bus.capacity() {
            bus.send(Command::LedOff, Duration::ZERO).unwrap();
        }
        let mut peer = Peer::new(b"led_on\n");

        dispatcher.serve(&mut peer, "test").unwrap();

        assert_eq!(peer.replies(), "led_on\n");
        assert_eq!(bus.len(), bus.capacity());
    }

    #[test]
    fn test_update_uses_bytes_buffered_behind_header() {
        let slots = MemorySlots::new(4096);
        let (dispatcher, bus) = dispatcher(&slots);
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut input = format!("PING\nOTA {} {:08X}\n", payload.len(), image_checksum(&payload))
            .into_bytes();
        input.extend_from_slice(&payload);
        input.extend_from_slice(&image_checksum(&payload).to_le_bytes());
        let mut peer = Peer::new(&input);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.serve(&mut peer, "test")))
            .expect_err("successful update restarts");

        assert!(unwound.downcast_ref::<RestartRequested>().is_some());
        assert_eq!(peer.replies(), "PONG\nACK\n");
        assert_eq!(bus.receive(Duration::ZERO), Ok(Command::OtaStart));
        assert_eq!(slots.snapshot().image, payload);
    }

    #[test]
    fn test_failed_update_reports_code_and_ends_session() {
        let slots = MemorySlots::new(4096);
        let (dispatcher, _bus) = dispatcher(&slots);
        let mut input = b"OTA 8 0\n".to_vec();
        input.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0]);
        input.extend_from_slice(b"PING\n");
        let mut peer = Peer::new(&input);

        let end = dispatcher.serve(&mut peer, "test").unwrap();

        assert!(matches!(end, SessionEnd::UpdateFailed(OtaError::Integrity { .. })));
        // Nothing after the failed image is treated as a command
        assert_eq!(peer.replies(), "ACK\nERR CRC\n");
        assert!(!slots.snapshot().boot_target_updated);
    }

    #[test]
    fn test_fatal_update_failure_restarts() {
        let slots = MemorySlots::new(4096);
        slots.configure(|f| f.fail_boot_switch = true);
        let (dispatcher, _bus) = dispatcher(&slots);
        let mut input = b"OTA 3 0\nabc".to_vec();
        input.extend_from_slice(&image_checksum(b"abc").to_le_bytes());
        let mut peer = Peer::new(&input);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.serve(&mut peer, "test")))
            .expect_err("fatal failure restarts");

        assert!(unwound.downcast_ref::<RestartRequested>().is_some());
        assert_eq!(peer.replies(), "ACK\nERR FINALIZE\n");
        assert_eq!(slots.snapshot().restarts, 1);
    }
}
