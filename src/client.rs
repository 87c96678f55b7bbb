//! Minimal NBD client used by integration tests and the `client` binary.
//!
//! Speaks just enough of the protocol to open one export by name via
//! `NBD_OPT_EXPORT_NAME` (not `NBD_OPT_GO`) and issue classic-header,
//! simple-reply transmission commands — enough to exercise a chain
//! end-to-end without pulling in TLS, structured replies, or extended
//! headers.

use color_eyre::eyre::bail;
use color_eyre::Result;

use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::proto::*;

#[derive(Debug)]
struct ExportInfo {
    size: u64,
    #[allow(dead_code)]
    transmit_flags: TransmitFlags,
}

/// A handle to one export on a remote NBD server.
#[derive(Debug)]
pub struct Client<IO: Read + Write> {
    conn: IO,
    export: ExportInfo,
}

impl<IO: Read + Write> Client<IO> {
    fn initial_handshake(stream: &mut (impl Read + Write)) -> Result<()> {
        let magic = stream.read_u64::<BE>()?;
        if magic != MAGIC {
            bail!(ProtocolError::new(format!("unexpected magic {magic}")));
        }
        let opt_magic = stream.read_u64::<BE>()?;
        if opt_magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected IHAVEOPT value {opt_magic}"
            )));
        }
        let server_flags = stream.read_u16::<BE>()?;
        let server_flags = HandshakeFlags::from_bits(server_flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected server flags {server_flags}")))?;
        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            bail!(ProtocolError::new(
                "server does not support fixed newstyle negotiation"
            ));
        }
        let client_flags = ClientHandshakeFlags::C_FIXED_NEWSTYLE;
        stream.write_u32::<BE>(client_flags.bits())?;
        Ok(())
    }

    fn put_export_name_option(stream: &mut (impl Write), name: &str) -> Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        let typ: u32 = OptType::EXPORT_NAME.into();
        stream.write_u32::<BE>(typ)?;
        stream.write_u32::<BE>(name.len() as u32)?;
        stream.write_all(name.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn handshake_haggle(stream: &mut (impl Read + Write), name: &str) -> Result<ExportInfo> {
        Self::put_export_name_option(stream, name)?;
        let size = stream.read_u64::<BE>()?;
        let transmit_flags = stream.read_u16::<BE>()?;
        let transmit_flags = TransmitFlags::from_bits(transmit_flags).ok_or_else(|| {
            ProtocolError::new(format!("invalid transmit flags {transmit_flags}"))
        })?;
        let mut padding = [0u8; 124];
        stream.read_exact(&mut padding)?;
        Ok(ExportInfo {
            size,
            transmit_flags,
        })
    }

    /// Establish a handshake with `stream`, requesting `export_name`.
    pub fn new(mut stream: IO, export_name: &str) -> Result<Self> {
        Self::initial_handshake(&mut stream)?;
        let export = Self::handshake_haggle(&mut stream, export_name)?;
        Ok(Self {
            conn: stream,
            export,
        })
    }

    /// The size of this export, as reported by the server during the
    /// handshake.
    pub fn size(&self) -> u64 {
        self.export.size
    }

    fn put_request(&mut self, typ: Cmd, offset: u64, len: u32, data: &[u8]) -> Result<u64> {
        // Handles only need to be unique per in-flight request; this
        // client never pipelines, so any stable function of the request
        // works.
        let handle = offset ^ ((len as u64) << 32) ^ (typ as u16 as u64);
        self.conn.write_u32::<BE>(REQUEST_MAGIC)?;
        self.conn.write_u16::<BE>(CmdFlags::empty().bits())?;
        self.conn.write_u16::<BE>(typ as u16)?;
        self.conn.write_u64::<BE>(handle)?;
        self.conn.write_u64::<BE>(offset)?;
        self.conn.write_u32::<BE>(len)?;
        self.conn.write_all(data)?;
        self.conn.flush()?;
        Ok(handle)
    }

    fn get_simple_reply(&mut self, want_handle: u64, buf: &mut [u8]) -> Result<()> {
        let magic = self.conn.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!(
                "unexpected reply magic {magic:#x}"
            )));
        }
        let err = self.conn.read_u32::<BE>()?;
        let err = ErrorType::try_from(err).unwrap_or(ErrorType::EIO);
        let handle = self.conn.read_u64::<BE>()?;
        if handle != want_handle {
            bail!(ProtocolError::new("reply handle mismatch"));
        }
        self.conn.read_exact(buf)?;
        if err != ErrorType::OK {
            bail!("server returned error {:?}", err);
        }
        Ok(())
    }

    /// Send a read command to the NBD server.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.put_request(Cmd::READ, offset, len, &[])?;
        let mut buf = vec![0; len as usize];
        self.get_simple_reply(handle, &mut buf)?;
        Ok(buf)
    }

    /// Send a write command to the NBD server.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.put_request(Cmd::WRITE, offset, data.len() as u32, data)?;
        self.get_simple_reply(handle, &mut [])?;
        Ok(())
    }

    /// Send a flush command to the NBD server.
    pub fn flush(&mut self) -> Result<()> {
        let handle = self.put_request(Cmd::FLUSH, 0, 0, &[])?;
        self.get_simple_reply(handle, &mut [])?;
        Ok(())
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.put_request(Cmd::DISCONNECT, 0, 0, &[])?;
        Ok(())
    }
}
