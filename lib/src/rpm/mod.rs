//! Reading RPM package files.
//!
//! A package is a 96 byte lead, a signature header (padded to a multiple
//! of 8 bytes), the main header and a compressed cpio payload.  [`open`]
//! consumes everything up to the payload and returns the main header along
//! with a [`CpioReader`] positioned at the first payload member.

use std::io::{self, Read};

use crate::{Error, Result};

pub mod cpio;
pub mod header;

pub use cpio::{ArchiveEntry, CpioReader, EntryKind};
pub use header::Header;

/// Size of the (obsolete) package lead.
pub const LEAD_SIZE: usize = 96;
/// Magic at the start of every package file.
pub const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

/// A decompressed payload stream.
pub type Payload<'a> = Box<dyn Read + Send + 'a>;

/// An opened package: its main header and a reader for the payload.
#[derive(Debug)]
pub struct Package<'a> {
    /// The main header
    pub header: Header,
    /// Payload members
    pub archive: CpioReader<PayloadReader<'a>>,
}

/// Wrapper around a decompressed payload stream.
pub struct PayloadReader<'a>(Payload<'a>);

impl std::fmt::Debug for PayloadReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadReader")
    }
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptArchive(msg.into())
}

/// Validate and skip the lead and the signature header.
fn skip_lead_and_signature(src: &mut impl Read) -> Result<()> {
    let mut lead = [0u8; LEAD_SIZE];
    src.read_exact(&mut lead)
        .map_err(|e| corrupt(format!("Reading package lead: {e}")))?;
    if lead[0..4] != LEAD_MAGIC {
        return Err(corrupt(format!(
            "Not an RPM package (magic {:02x?})",
            &lead[0..4]
        )));
    }
    let sig = Header::read_from(src)?;
    let len = sig.as_bytes().len();
    let pad = (8 - (len % 8)) % 8;
    let mut buf = [0u8; 8];
    src.read_exact(&mut buf[..pad])
        .map_err(|e| corrupt(format!("Reading signature padding: {e}")))?;
    tracing::trace!("Skipped signature header of {len} bytes");
    Ok(())
}

/// Wrap the raw payload in the decompressor named by the header.
pub fn payload_decoder<'a>(header: &Header, src: impl Read + Send + 'a) -> Result<Payload<'a>> {
    match header.get_string(header::tag::PAYLOADFORMAT)? {
        None | Some("cpio") => {}
        Some(o) => return Err(corrupt(format!("Unsupported payload format {o}"))),
    }
    let compressor = header.get_string(header::tag::PAYLOADCOMPRESSOR)?;
    tracing::debug!("Payload compressor: {}", compressor.unwrap_or("gzip"));
    let r: Payload<'a> = match compressor {
        None | Some("gzip") => Box::new(flate2::read::GzDecoder::new(src)),
        Some("xz") => Box::new(xz2::read::XzDecoder::new(src)),
        Some("lzma") => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| corrupt(format!("Initializing lzma decoder: {e}")))?;
            Box::new(xz2::read::XzDecoder::new_stream(src, stream))
        }
        Some("zstd") => Box::new(
            zstd::stream::read::Decoder::new(src)
                .map_err(|e| corrupt(format!("Initializing zstd decoder: {e}")))?,
        ),
        Some(o) => return Err(corrupt(format!("Unsupported payload compressor {o}"))),
    };
    Ok(r)
}

/// Open a complete package file.
pub fn open<'a>(mut src: impl Read + Send + 'a) -> Result<Package<'a>> {
    skip_lead_and_signature(&mut src)?;
    let header = Header::read_from(&mut src)?;
    from_parts(header, src)
}

/// Open a package from an already split header and raw payload stream.
pub fn from_parts<'a>(header: Header, payload: impl Read + Send + 'a) -> Result<Package<'a>> {
    let payload = payload_decoder(&header, payload)?;
    Ok(Package {
        header,
        archive: CpioReader::new(PayloadReader(payload)),
    })
}
