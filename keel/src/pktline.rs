//! Git packet-line framing.
//!
//! The smart protocol frames payloads as `<4 hex digits><payload>`,
//! with `0000` (flush) and `0001` (delimiter) as special packets.
//! Multiplexed streams additionally prefix each data packet's payload
//! with a side-band byte.

use std::io;
use std::io::{Read, Write};
use std::str;

/// Length header size.
pub const HEADER_LEN: usize = 4;
/// Largest payload that fits one packet.
pub const MAX_PAYLOAD: usize = 65516;

/// Data side-band.
pub const BAND_DATA: u8 = 1;
/// Progress side-band.
pub const BAND_PROGRESS: u8 = 2;
/// Error side-band.
pub const BAND_ERROR: u8 = 3;

/// A parsed packet-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0000`: section or stream terminator.
    Flush,
    /// `0001`: protocol v2 section delimiter.
    Delim,
    /// A payload-carrying packet.
    Data(Vec<u8>),
}

/// Reads packet-lines off a byte stream.
pub struct Reader<'a, R> {
    stream: &'a mut R,
}

impl<'a, R: io::Read> Reader<'a, R> {
    pub fn new(stream: &'a mut R) -> Self {
        Self { stream }
    }

    /// Read the next packet. Returns `None` on a clean end of stream.
    pub fn read_packet(&mut self) -> io::Result<Option<Packet>> {
        let mut header = [0u8; HEADER_LEN];

        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let length = str::from_utf8(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let length = usize::from_str_radix(length, 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        match length {
            0 => Ok(Some(Packet::Flush)),
            1 => Ok(Some(Packet::Delim)),
            n if n < HEADER_LEN => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid packet-line length {n}"),
            )),
            n => {
                let mut payload = vec![0u8; n - HEADER_LEN];
                self.stream.read_exact(&mut payload)?;

                Ok(Some(Packet::Data(payload)))
            }
        }
    }
}

impl<'a, R: io::Read> io::Read for Reader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

/// Frame a payload as a single data packet.
pub fn data(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);

    let mut pkt = format!("{:04x}", payload.len() + HEADER_LEN).into_bytes();
    pkt.extend_from_slice(payload);
    pkt
}

/// The flush packet.
pub fn flush() -> &'static [u8] {
    b"0000"
}

/// Frame a payload on the given side-band, chunking as needed.
pub fn sideband(band: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN + 1);

    for chunk in payload.chunks(MAX_PAYLOAD - 1) {
        let mut framed = Vec::with_capacity(chunk.len() + 1);
        framed.push(band);
        framed.extend_from_slice(chunk);
        out.extend_from_slice(&data(&framed));
    }
    out
}

/// Frame an in-band error for the client, on side-band 3.
pub fn error(msg: &str) -> Vec<u8> {
    let mut out = sideband(BAND_ERROR, format!("ERR {msg}\n").as_bytes());
    out.extend_from_slice(flush());
    out
}

/// Write the `# service=<name>` prelude sent before a v0/v1 ref
/// advertisement.
pub fn service_prelude<W: Write>(writer: &mut W, service: &str) -> io::Result<()> {
    writer.write_all(&data(format!("# service={service}\n").as_bytes()))?;
    writer.write_all(flush())?;

    Ok(())
}

/// Drain a reader into packets until flush or end of stream.
pub fn read_to_flush<R: Read>(reader: &mut R) -> io::Result<Vec<Packet>> {
    let mut reader = Reader::new(reader);
    let mut packets = Vec::new();

    while let Some(pkt) = reader.read_packet()? {
        if pkt == Packet::Flush {
            break;
        }
        packets.push(pkt);
    }
    Ok(packets)
}
