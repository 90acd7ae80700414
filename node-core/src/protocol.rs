// Line-oriented wire protocol spoken on the command port
//
//   PING                  -> PONG
//   AUTH <token>          -> OK | DENIED
//   led_on / led_off      -> echoed back
//   OTA <size> <hex-crc>  -> ACK, then <size> raw bytes + 4 byte LE CRC-32
//                            (or BADFMT)
//   anything else         -> WHAT?

use std::io::{self, Write};

use crc::{Crc, CRC_32_ISO_HDLC};

/// Default TCP port of the command listener.
pub const DEFAULT_PORT: u16 = 8080;

/// CRC-32 used for the image trailer: zero seed, reflected, polynomial
/// 0x04C11DB7. Matches zlib's `crc32`.
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Size of the checksum trailer that follows the payload.
pub const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaHeader {
    pub size: u32,
    /// Checksum announced in the header line. The engine verifies the binary
    /// trailer instead; this field is parsed and carried for logging only.
    pub crc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Ping,
    Auth(&'a str),
    LedOn,
    LedOff,
    Ota(OtaHeader),
    BadOta,
    Unknown,
}

impl<'a> Request<'a> {
    /// Classify one line (terminator already removed).
    pub fn parse(line: &'a str) -> Self {
        match line {
            "PING" => return Request::Ping,
            "led_on" => return Request::LedOn,
            "led_off" => return Request::LedOff,
            _ => {}
        }

        if let Some(token) = line.strip_prefix("AUTH ") {
            return Request::Auth(token);
        }

        match line.split_once(' ') {
            Some(("OTA", args)) => parse_ota_args(args).map_or(Request::BadOta, Request::Ota),
            None if line == "OTA" => Request::BadOta,
            _ => Request::Unknown,
        }
    }

    /// Classify raw line bytes; anything that is not UTF-8 is unknown.
    pub fn parse_bytes(line: &'a [u8]) -> Self {
        core::str::from_utf8(line).map_or(Request::Unknown, Request::parse)
    }
}

fn parse_ota_args(args: &str) -> Option<OtaHeader> {
    let mut fields = args.split_whitespace();
    let size = fields.next()?.parse::<u32>().ok()?;
    let crc = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    let crc = crc
        .strip_prefix("0x")
        .or_else(|| crc.strip_prefix("0X"))
        .unwrap_or(crc);
    let crc = u32::from_str_radix(crc, 16).ok()?;
    Some(OtaHeader { size, crc })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Ok,
    Denied,
    LedOn,
    LedOff,
    Ack,
    BadFormat,
    What,
    /// Connection refused because the session limit is reached.
    Busy,
    /// An update failed after `ACK`; carries the failure code.
    Error(&'static str),
}

impl Reply {
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        match self {
            Reply::Error(code) => writeln!(out, "ERR {code}")?,
            other => {
                out.write_all(other.text().as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        out.flush()
    }

    fn text(&self) -> &'static str {
        match self {
            Reply::Pong => "PONG",
            Reply::Ok => "OK",
            Reply::Denied => "DENIED",
            Reply::LedOn => "led_on",
            Reply::LedOff => "led_off",
            Reply::Ack => "ACK",
            Reply::BadFormat => "BADFMT",
            Reply::What => "WHAT?",
            Reply::Busy => "BUSY",
            Reply::Error(_) => "ERR",
        }
    }
}

/// Checksum of a complete image, as appended by senders.
pub fn image_checksum(image: &[u8]) -> u32 {
    IMAGE_CRC.checksum(image)
}

/// Header line announcing an image, without terminator.
pub fn ota_header_line(size: u32, crc: u32) -> String {
    format!("OTA {size} {crc:08X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_keywords() {
        assert_eq!(Request::parse("PING"), Request::Ping);
        assert_eq!(Request::parse("led_on"), Request::LedOn);
        assert_eq!(Request::parse("led_off"), Request::LedOff);
        assert_eq!(Request::parse("FOO"), Request::Unknown);
        assert_eq!(Request::parse(""), Request::Unknown);
        assert_eq!(Request::parse("PINGPONG"), Request::Unknown);
    }

    #[test]
    fn test_auth_carries_token() {
        assert_eq!(Request::parse("AUTH hunter2"), Request::Auth("hunter2"));
        assert_eq!(Request::parse("AUTH "), Request::Auth(""));
        assert_eq!(Request::parse("AUTH"), Request::Unknown);
    }

    #[test]
    fn test_ota_header_parsing() {
        assert_eq!(
            Request::parse("OTA 1024 DEADBEEF"),
            Request::Ota(OtaHeader { size: 1024, crc: 0xDEAD_BEEF })
        );
        assert_eq!(
            Request::parse("OTA 7 0x1f"),
            Request::Ota(OtaHeader { size: 7, crc: 0x1F })
        );
        assert_eq!(Request::parse("OTA"), Request::BadOta);
        assert_eq!(Request::parse("OTA 12"), Request::BadOta);
        assert_eq!(Request::parse("OTA -1 00"), Request::BadOta);
        assert_eq!(Request::parse("OTA 12 zz"), Request::BadOta);
        assert_eq!(Request::parse("OTA 12 00 extra"), Request::BadOta);
        assert_eq!(Request::parse("OTA 99999999999 00"), Request::BadOta);
    }

    #[test]
    fn test_non_utf8_line_is_unknown() {
        assert_eq!(Request::parse_bytes(&[0xFF, 0xFE]), Request::Unknown);
        assert_eq!(Request::parse_bytes(b"PING"), Request::Ping);
    }

    #[test]
    fn test_reply_wire_format() {
        let mut out = Vec::new();
        Reply::What.write_to(&mut out).unwrap();
        Reply::Error("CRC").write_to(&mut out).unwrap();
        assert_eq!(out, b"WHAT?\nERR CRC\n");
    }

    #[test]
    fn test_checksum_matches_zlib_reference() {
        // zlib.crc32(b"123456789")
        assert_eq!(image_checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(ota_header_line(9, 0xCBF4_3926), "OTA 9 CBF43926");
    }
}
