//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. This covers the fixed-newstyle handshake,
//! option negotiation (including STARTTLS, INFO/GO, metadata contexts and
//! extended headers), and the transmission phase (classic and extended
//! request headers, simple and structured replies).
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use log::warn;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*, ErrorKind};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const TCP_PORT: u16 = 10809;

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const EXTENDED_REQUEST_MAGIC: u32 = 0x21e41c71;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub(crate) const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Ceiling on a single request's payload length. Requests that exceed
/// this are rejected with `EINVAL` during dispatch rather than committing
/// an unbounded buffer.
pub const MAX_REQUEST_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags sent in `NBD_OPT_EXPORT_NAME` /
  /// `NBD_INFO_EXPORT` replies, derived from a connection's memoized
  /// capability set.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
    EXTENDED_HEADERS = 11,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone)]
#[repr(u16)]
pub enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_POLICY = (1 << 31) + 2,
    ERR_INVALID = (1 << 31) + 3,
    ERR_TLS_REQD = (1 << 31) + 5,
    ERR_UNKNOWN = (1 << 31) + 6,
    ERR_SHUTDOWN = (1 << 31) + 7,
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    ERR_TOO_BIG = (1 << 31) + 9,
}

/// Builder for replying to an option.
#[must_use]
pub struct OptReply {
    opt: OptType,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    pub fn ack(opt: OptType) -> Self {
        Self {
            opt,
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    pub fn new(opt: OptType, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            opt,
            reply_type,
            data,
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type (e.g. NBD_REP_ACK, or NBD_REP_ERR_UNSUP)
        // S: 32 bits, length of the reply, possibly zero
        // S: any data as required by the reply
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.opt.into())?;
        stream.write_u32::<BE>(self.reply_type.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError(format!("unexpected option magic {magic}")));
        }
        let option = stream.read_u32::<BE>()?;
        let typ = OptType::try_from(option)
            .map_err(|_| ProtocolError(format!("unexpected option {option}")))?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len < 10_000_000,
            ProtocolError(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {:?} of size {option_len}", typ))?;
        Ok(Self { typ, data })
    }
}

/// Builder for replies to a `NBD_OPT_LIST` request.
#[must_use]
pub struct ExportList {
    export_names: Vec<String>,
}

impl ExportList {
    pub fn new(export_names: Vec<String>) -> Self {
        Self { export_names }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> Result<()> {
        // zero or more NBD_REP_SERVER replies, one per export, then an ack.
        // the server MAY omit TLS-only exports if TLS hasn't been negotiated
        // yet, which the caller handles before constructing `export_names`.
        for name in self.export_names.into_iter() {
            let mut data = vec![];
            data.write_u32::<BE>(name.len() as u32)?;
            data.write_all(name.as_bytes())?;
            OptReply::new(OptType::LIST, ReplyType::SERVER, data).put(&mut stream)?;
        }
        OptReply::ack(OptType::LIST).put(&mut stream)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InfoRequest {
    pub name: String,
    pub typs: Vec<InfoType>,
}

impl InfoRequest {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let name_len = stream.read_u32::<BE>()?;
        let mut buf = vec![0; name_len as usize];
        stream.read_exact(&mut buf)?;
        let name = String::from_utf8(buf)
            .wrap_err(ProtocolError::new("invalid UTF-8 in requested export"))?;
        let num_requests = stream.read_u16::<BE>()?;
        let mut typs = vec![];
        for _ in 0..num_requests {
            let typ = stream.read_u16::<BE>()?;
            let typ = InfoType::try_from(typ)
                .map_err(|_| ProtocolError::new(format!("invalid info type {typ}")))?;
            typs.push(typ);
        }
        Ok(InfoRequest { name, typs })
    }
}

/// A `NBD_OPT_{SET,LIST}_META_CONTEXT` request body: an export name plus
/// an ordered list of queried context-name patterns. Only literal matches
/// against `base:allocation` are implemented; glob queries match nothing.
#[derive(Debug, Clone)]
pub struct MetaContextRequest {
    pub export_name: String,
    pub queries: Vec<String>,
}

impl MetaContextRequest {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let name_len = stream.read_u32::<BE>()?;
        let mut buf = vec![0; name_len as usize];
        stream.read_exact(&mut buf)?;
        let export_name = String::from_utf8(buf)
            .wrap_err(ProtocolError::new("invalid UTF-8 in requested export"))?;
        let num_queries = stream.read_u32::<BE>()?;
        let mut queries = Vec::with_capacity(num_queries as usize);
        for _ in 0..num_queries {
            let len = stream.read_u32::<BE>()?;
            let mut buf = vec![0; len as usize];
            stream.read_exact(&mut buf)?;
            queries.push(
                String::from_utf8(buf)
                    .wrap_err(ProtocolError::new("invalid UTF-8 in context query"))?,
            );
        }
        Ok(MetaContextRequest {
            export_name,
            queries,
        })
    }
}

/// Reply to a single accepted context, assigning it the id that later
/// `NBD_CMD_BLOCK_STATUS` replies will reference.
pub fn put_meta_context_reply<IO: Write>(
    stream: &mut IO,
    opt: OptType,
    id: u32,
    name: &str,
) -> Result<()> {
    let mut data = vec![];
    data.write_u32::<BE>(id)?;
    data.write_all(name.as_bytes())?;
    OptReply::new(opt, ReplyType::META_CONTEXT, data).put(stream)?;
    Ok(())
}

// -------------------
// Transmission phase
// -------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        const FUA = 1 << 0;
        const NO_HOLE = 1 << 1;
        // "don't fragment"
        const DF = 1 << 2;
        const REQ_ONE = 1 << 3;
        const FAST_ZERO = 1 << 4;
        const PAYLOAD_LEN = 1 << 5;
    }
}

/// Whether a connection negotiated classic (28-byte) or extended
/// (32-byte) transmission headers, via the `EXTENDED_HEADERS` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Classic,
    Extended,
}

pub struct Request {
    #[allow(dead_code)]
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    /// requested length in bytes, widened to u64 even in classic mode
    pub len: u64,
    /// how much of the caller's buffer holds a WRITE payload
    pub data_len: usize,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("Request");
        if !self.flags.is_empty() {
            f = f.field("flags", &self.flags);
        }
        f = f.field("typ", &self.typ);
        if matches!(
            self.typ,
            Cmd::READ | Cmd::WRITE | Cmd::TRIM | Cmd::CACHE | Cmd::BLOCK_STATUS
        ) {
            f = f.field("offset", &self.offset);
        }
        if self.len != 0 {
            f = f.field("len", &self.len);
        }
        f.finish_non_exhaustive()
    }
}

impl Request {
    /// Read one request header (classic or extended, per `mode`), using
    /// `buf` as scratch space for a WRITE payload.
    pub fn get<IO: Read>(mut stream: IO, mode: HeaderMode, buf: &mut [u8]) -> Result<Option<Self>> {
        let magic = match stream.read_u32::<BE>() {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let expected = match mode {
            HeaderMode::Classic => REQUEST_MAGIC,
            HeaderMode::Extended => EXTENDED_REQUEST_MAGIC,
        };
        if magic != expected {
            bail!(ProtocolError(format!("wrong request magic {magic:#x}")));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = CmdFlags::from_bits(flags)
            .ok_or_else(|| ProtocolError(format!("unexpected command flags {flags}")))?;
        let typ = stream.read_u16::<BE>()?;
        let typ =
            Cmd::try_from(typ).map_err(|_| ProtocolError(format!("unexpected command {typ}")))?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len: u64 = match mode {
            HeaderMode::Classic => stream.read_u32::<BE>()? as u64,
            HeaderMode::Extended => stream.read_u64::<BE>()?,
        };

        if len > MAX_REQUEST_LEN {
            bail!(ProtocolError(format!("request length {len} too large")));
        }

        let data_len = if typ == Cmd::WRITE {
            let n = (len as usize).min(buf.len());
            stream
                .read_exact(&mut buf[..n])
                .wrap_err_with(|| format!("parsing write request of length {len}"))?;
            n
        } else {
            0
        };

        Ok(Some(Self {
            flags,
            typ,
            handle,
            offset,
            len,
            data_len,
        }))
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EACCES = 13,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

impl ErrorType {
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::EPERM,
            ErrorKind::InvalidInput => Self::EOVERFLOW,
            ErrorKind::UnexpectedEof => Self::EOVERFLOW,
            _ => {
                warn!("unexpected error {}", kind);
                Self::EIO
            }
        }
    }
}

#[derive(Debug)]
#[must_use]
pub struct SimpleReply<'a> {
    err: ErrorType,
    handle: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    pub fn data(req: &Request, data: &'a [u8]) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
            data,
        }
    }

    pub fn ok(req: &Request) -> Self {
        Self::data(req, &[])
    }

    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply {
            err,
            handle: req.handle,
            data: &[],
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_all(self.data)?;
        Ok(())
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StructuredReplyFlags: u16 {
        const DONE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StructuredReplyType {
    None = 0,
    OffsetData = 1,
    OffsetHole = 2,
    BlockStatus = 5,
    Error = 32769,
    ErrorOffset = 32770,
}

enum StructuredPayload<'a> {
    Empty,
    OffsetData { offset: u64, data: &'a [u8] },
    OffsetHole { offset: u64, length: u32 },
    /// one (context id, [(run length, status flags)]) pair per context
    BlockStatus { entries: &'a [(u32, Vec<(u64, u32)>)] },
    Error { code: ErrorType, message: &'a str },
}

/// A single chunk of a structured reply. The dispatcher emits one or
/// more of these per request when structured replies are negotiated,
/// the last one carrying [`StructuredReplyFlags::DONE`].
#[must_use]
pub struct StructuredChunk<'a> {
    handle: u64,
    done: bool,
    typ: StructuredReplyType,
    payload: StructuredPayload<'a>,
}

impl<'a> StructuredChunk<'a> {
    pub fn none(handle: u64, done: bool) -> Self {
        StructuredChunk {
            handle,
            done,
            typ: StructuredReplyType::None,
            payload: StructuredPayload::Empty,
        }
    }

    pub fn offset_data(handle: u64, done: bool, offset: u64, data: &'a [u8]) -> Self {
        StructuredChunk {
            handle,
            done,
            typ: StructuredReplyType::OffsetData,
            payload: StructuredPayload::OffsetData { offset, data },
        }
    }

    pub fn offset_hole(handle: u64, done: bool, offset: u64, length: u32) -> Self {
        StructuredChunk {
            handle,
            done,
            typ: StructuredReplyType::OffsetHole,
            payload: StructuredPayload::OffsetHole { offset, length },
        }
    }

    pub fn block_status(handle: u64, done: bool, entries: &'a [(u32, Vec<(u64, u32)>)]) -> Self {
        StructuredChunk {
            handle,
            done,
            typ: StructuredReplyType::BlockStatus,
            payload: StructuredPayload::BlockStatus { entries },
        }
    }

    pub fn error(handle: u64, code: ErrorType, message: &'a str) -> Self {
        StructuredChunk {
            handle,
            done: true,
            typ: StructuredReplyType::Error,
            payload: StructuredPayload::Error { code, message },
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> Result<()> {
        let mut flags = StructuredReplyFlags::empty();
        if self.done {
            flags |= StructuredReplyFlags::DONE;
        }

        let mut body = vec![];
        match &self.payload {
            StructuredPayload::Empty => {}
            StructuredPayload::OffsetData { offset, data } => {
                body.write_u64::<BE>(*offset)?;
                body.write_all(data)?;
            }
            StructuredPayload::OffsetHole { offset, length } => {
                body.write_u64::<BE>(*offset)?;
                body.write_u32::<BE>(*length)?;
            }
            StructuredPayload::BlockStatus { entries } => {
                for (context_id, descriptors) in entries.iter() {
                    body.write_u32::<BE>(*context_id)?;
                    for (length, status) in descriptors {
                        body.write_u32::<BE>(*length as u32)?;
                        body.write_u32::<BE>(*status)?;
                    }
                }
            }
            StructuredPayload::Error { code, message } => {
                body.write_u32::<BE>((*code).into())?;
                body.write_u16::<BE>(message.len() as u16)?;
                body.write_all(message.as_bytes())?;
            }
        }

        stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
        stream.write_u16::<BE>(flags.bits())?;
        stream.write_u16::<BE>(self.typ as u16)?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u32::<BE>(body.len() as u32)?;
        stream.write_all(&body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_reply_roundtrip_ack() {
        let mut buf = vec![];
        OptReply::ack(OptType::LIST).put(&mut buf).unwrap();
        assert_eq!(buf.len(), 8 + 4 + 4 + 4);
    }

    #[test]
    fn simple_reply_is_16_bytes_plus_data() {
        let req = Request {
            flags: CmdFlags::empty(),
            typ: Cmd::READ,
            handle: 42,
            offset: 0,
            len: 4,
            data_len: 0,
        };
        let mut buf = vec![];
        SimpleReply::data(&req, &[1, 2, 3, 4])
            .put(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), 16 + 4);
    }

    #[test]
    fn structured_chunk_offset_data_layout() {
        let mut buf = vec![];
        StructuredChunk::offset_data(7, true, 100, &[9, 9, 9])
            .put(&mut buf)
            .unwrap();
        // magic(4) + flags(2) + type(2) + handle(8) + length(4) + offset(8) + data(3)
        assert_eq!(buf.len(), 4 + 2 + 2 + 8 + 4 + 8 + 3);
    }
}
