//! Per-connection state machine and request dispatcher (§4.2-§4.4).
//!
//! A [`Server`] is built once at startup around a fixed [`Chain`] and is
//! shared read-only by every connection. Each accepted connection gets
//! its own [`Connection`], which drives the client through
//! `NEW_SEND -> NEW_RECV_FLAGS -> OPT_WAIT -> [TLS_START ->
//! TLS_HANDSHAKE ->] GO_FINISH -> READY` and then loops
//! `RECV_REQUEST -> DISPATCH -> SEND_REPLY` until the client disconnects,
//! a protocol violation kills the connection, or the watchdog (§5) shuts
//! the socket out from under a stalled read.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use log::{info, trace, warn};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::capability::Capabilities;
use crate::chain::{Chain, Extent, Handle, ThreadModel};
use crate::error::ChainError;
use crate::proto::*;
use crate::transport::{shutdown_write_fd, ReadWriteStream};

/// Immutable, process-wide configuration every connection worker shares.
/// Built once in `main` and handed to [`Server::handle_connection`] by
/// the transport's accept loop.
pub struct Server {
    chain: Arc<Chain>,
    export_name: String,
    readonly: bool,
    tls_config: Option<Arc<ServerConfig>>,
    timeout: Option<Duration>,
    /// Held for the whole connection when the chain's effective model is
    /// `SerializeConnections` (§4.3: "one connection is served at a
    /// time; others wait").
    connection_lock: Mutex<()>,
    /// Held around every top-of-chain call (F, the dispatcher, and E,
    /// capability negotiation) when the effective model is
    /// `SerializeAllRequests` (§4.3: "at most one request-in-flight
    /// across the whole chain"). `SerializeRequests` needs no lock of
    /// its own here: each connection already drives its dispatch loop
    /// from a single thread, one request at a time.
    request_lock: Mutex<()>,
}

impl Server {
    pub fn new(chain: Arc<Chain>, export_name: String, readonly: bool) -> Self {
        Server {
            chain,
            export_name,
            readonly,
            tls_config: None,
            timeout: None,
            connection_lock: Mutex::new(()),
            request_lock: Mutex::new(()),
        }
    }

    pub fn with_tls(mut self, tls_config: Arc<ServerConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_config.is_some()
    }

    /// Run `f` under `request_lock` iff the chain's effective thread
    /// model requires it (§4.3). A poisoned lock (some other connection
    /// panicked mid-request) is treated as "proceed unlocked" rather
    /// than propagating the poison, since the dispatcher always
    /// recovers from an error on its own connection.
    fn with_chain_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.chain.thread_model() == ThreadModel::SerializeAllRequests {
            let _guard = self.request_lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        } else {
            f()
        }
    }

    /// Drive one accepted connection to completion (component B). Only a
    /// bug inside the chain itself should unwind past this; every
    /// protocol or I/O error from the client just ends this one
    /// connection.
    pub fn handle_connection(&self, stream: Box<dyn ReadWriteStream>, peer: String) {
        // `SerializeConnections` (§4.3) means the whole connection, not
        // just individual requests, runs exclusively of every other one.
        let _conn_guard = (self.chain.thread_model() == ThreadModel::SerializeConnections)
            .then(|| self.connection_lock.lock().unwrap_or_else(|e| e.into_inner()));

        let raw_fd = stream.raw_fd();
        let mut conn = Connection {
            stream: Stream::Plain(stream),
            peer,
            server: self,
            raw_fd,
            no_zeroes: false,
            header_mode: HeaderMode::Classic,
            structured_reply: false,
            meta_contexts: Vec::new(),
            watchdog_generation: Arc::new(AtomicU64::new(0)),
        };
        info!("{}: connected", conn.peer);
        if let Err(err) = conn.run() {
            warn!("{}: connection ended: {err}", conn.peer);
        } else {
            info!("{}: disconnected", conn.peer);
        }
    }
}

/// Either side of a STARTTLS upgrade, unified so the rest of the state
/// machine never has to care which one it's talking to.
enum Stream {
    Plain(Box<dyn ReadWriteStream>),
    Tls(Box<StreamOwned<ServerConnection, Box<dyn ReadWriteStream>>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// A placeholder occupying `Connection::stream` for the instant between
/// taking the plain stream out to wrap it in TLS and putting the wrapped
/// version back; never observed doing real I/O.
struct NullStream;

impl Read for NullStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for NullStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReadWriteStream for NullStream {
    fn shutdown_write(&self) -> io::Result<()> {
        Ok(())
    }
}

/// The export a client selected via `EXPORT_NAME`/`GO`, with its chain
/// handles already opened and its capability set already memoized
/// (§3's "established once per (connection, export) and memoized").
struct Selected {
    name: String,
    handles: Vec<Handle>,
    capabilities: Capabilities,
}

struct Connection<'a> {
    stream: Stream,
    peer: String,
    server: &'a Server,
    raw_fd: Option<RawFd>,
    no_zeroes: bool,
    header_mode: HeaderMode,
    structured_reply: bool,
    meta_contexts: Vec<(u32, String)>,
    watchdog_generation: Arc<AtomicU64>,
}

impl<'a> Connection<'a> {
    fn run(&mut self) -> Result<()> {
        self.initial_handshake()?;
        match self.option_phase()? {
            Some(selected) => self.ready_loop(selected),
            None => Ok(()),
        }
    }

    fn initial_handshake(&mut self) -> Result<()> {
        self.stream.write_u64::<BE>(MAGIC)?;
        self.stream.write_u64::<BE>(IHAVEOPT)?;
        let server_flags = HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES;
        self.stream.write_u16::<BE>(server_flags.bits())?;
        self.stream.flush()?;

        let client_flags = self.stream.read_u32::<BE>()?;
        let client_flags = ClientHandshakeFlags::from_bits(client_flags).ok_or_else(|| {
            ProtocolError::new(format!("unexpected client handshake flags {client_flags}"))
        })?;
        if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
            bail!(ProtocolError::new(
                "client does not support fixed newstyle negotiation"
            ));
        }
        self.no_zeroes = client_flags.contains(ClientHandshakeFlags::C_NO_ZEROES);
        Ok(())
    }

    fn export_exists(&self, name: &str) -> bool {
        name.is_empty() || name == self.server.export_name
    }

    /// Open the chain for `name`, memoizing its capability set. Closes
    /// the partially-opened handles itself on any failure.
    fn open_export(&self, name: &str) -> Result<(Vec<Handle>, Capabilities)> {
        if !self.export_exists(name) {
            bail!(ProtocolError::new(format!("unknown export {name:?}")));
        }
        let handles = self.server.chain.open(self.server.readonly)?;
        let result: crate::error::Result<Capabilities> = self.server.with_chain_lock(|| {
            self.server.chain.top(&handles).prepare()?;
            let mut caps = self.server.chain.capabilities(&handles)?;
            if self.server.readonly {
                caps.force_read_only();
            }
            Ok(caps)
        });
        match result {
            Ok(caps) => Ok((handles, caps)),
            Err(err) => {
                self.server.chain.close(handles);
                Err(err.into())
            }
        }
    }

    /// Close an export opened just to answer `NBD_OPT_INFO`, pairing the
    /// `prepare()` done in `open_export` with a `finalize()` before the
    /// handles go away.
    fn close_export(&self, handles: Vec<Handle>) {
        if let Err(err) = self.server.chain.top(&handles).finalize() {
            warn!("{}: finalize failed: {err}", self.peer);
        }
        self.server.chain.close(handles);
    }

    /// Loop over `OPT_WAIT` until a `GO`/legacy `EXPORT_NAME` puts the
    /// connection in `READY`, or the client aborts/disconnects/sends
    /// something unrecoverable (§4.2).
    fn option_phase(&mut self) -> Result<Option<Selected>> {
        loop {
            let opt = match Opt::get(&mut self.stream) {
                Ok(opt) => opt,
                Err(err) => {
                    warn!("{}: malformed option, closing: {err}", self.peer);
                    return Ok(None);
                }
            };
            trace!("{}: option {:?}", self.peer, opt.typ);

            match opt.typ {
                OptType::EXPORT_NAME => {
                    let name = String::from_utf8(opt.data).unwrap_or_default();
                    return match self.open_export(&name) {
                        Ok((handles, capabilities)) => {
                            self.send_legacy_export_info(&capabilities)?;
                            Ok(Some(Selected {
                                name,
                                handles,
                                capabilities,
                            }))
                        }
                        Err(err) => {
                            // NBD_OPT_EXPORT_NAME has no error reply in
                            // the wire protocol; an unknown export can
                            // only be signaled by closing the connection.
                            warn!("{}: {err}, closing", self.peer);
                            Ok(None)
                        }
                    };
                }
                OptType::ABORT => {
                    OptReply::ack(OptType::ABORT).put(&mut self.stream)?;
                    return Ok(None);
                }
                OptType::LIST => {
                    let names = vec![self.server.export_name.clone()];
                    ExportList::new(names).put(&mut self.stream)?;
                }
                OptType::STARTTLS => self.handle_starttls()?,
                OptType::INFO | OptType::GO => {
                    if let Some(selected) = self.handle_info_or_go(&opt)? {
                        return Ok(Some(selected));
                    }
                }
                OptType::STRUCTURED_REPLY => {
                    self.structured_reply = true;
                    OptReply::ack(OptType::STRUCTURED_REPLY).put(&mut self.stream)?;
                }
                OptType::SET_META_CONTEXT => self.handle_set_meta_context(&opt.data)?,
                OptType::LIST_META_CONTEXT => self.handle_list_meta_context(&opt.data)?,
                OptType::EXTENDED_HEADERS => {
                    self.header_mode = HeaderMode::Extended;
                    OptReply::ack(OptType::EXTENDED_HEADERS).put(&mut self.stream)?;
                }
                OptType::PEEK_EXPORT => {
                    OptReply::new(opt.typ, ReplyType::ERR_UNSUP, vec![]).put(&mut self.stream)?;
                }
            }
        }
    }

    fn send_legacy_export_info(&mut self, caps: &Capabilities) -> Result<()> {
        self.stream.write_u64::<BE>(caps.size)?;
        self.stream
            .write_u16::<BE>(caps.to_transmit_flags().bits())?;
        if !self.no_zeroes {
            self.stream.write_all(&[0u8; 124])?;
        }
        self.stream.flush()?;
        Ok(())
    }

    fn handle_starttls(&mut self) -> Result<()> {
        if matches!(self.stream, Stream::Tls(_)) {
            OptReply::new(OptType::STARTTLS, ReplyType::ERR_INVALID, vec![])
                .put(&mut self.stream)?;
            return Ok(());
        }
        let Some(tls_config) = self.server.tls_config.clone() else {
            OptReply::new(OptType::STARTTLS, ReplyType::ERR_POLICY, vec![])
                .put(&mut self.stream)?;
            return Ok(());
        };
        OptReply::ack(OptType::STARTTLS).put(&mut self.stream)?;

        let plain = match std::mem::replace(&mut self.stream, Stream::Plain(Box::new(NullStream)))
        {
            Stream::Plain(s) => s,
            Stream::Tls(_) => unreachable!(),
        };
        let conn = ServerConnection::new(tls_config)
            .map_err(|e| ProtocolError::new(format!("tls setup failed: {e}")))?;
        let mut tls_stream = StreamOwned::new(conn, plain);
        tls_stream
            .conn
            .complete_io(&mut tls_stream.sock)
            .map_err(|e| ProtocolError::new(format!("tls handshake failed: {e}")))?;
        self.stream = Stream::Tls(Box::new(tls_stream));
        info!("{}: upgraded to TLS", self.peer);
        Ok(())
    }

    /// Handles both `NBD_OPT_INFO` and `NBD_OPT_GO`: they share every
    /// reply except that `GO` also transitions to `READY` (§4.2).
    fn handle_info_or_go(&mut self, opt: &Opt) -> Result<Option<Selected>> {
        let is_go = opt.typ == OptType::GO;
        let req = InfoRequest::get(&opt.data[..])?;

        let (handles, caps) = match self.open_export(&req.name) {
            Ok(v) => v,
            Err(err) => {
                warn!("{}: {err}", self.peer);
                OptReply::new(opt.typ, ReplyType::ERR_UNKNOWN, vec![]).put(&mut self.stream)?;
                return Ok(None);
            }
        };

        let requested = if req.typs.is_empty() {
            vec![InfoType::EXPORT]
        } else {
            req.typs.clone()
        };
        for typ in requested {
            if let Err(err) = self.send_info(opt.typ, typ, &req.name, &handles, &caps) {
                self.close_export(handles);
                return Err(err);
            }
        }
        OptReply::ack(opt.typ).put(&mut self.stream)?;

        if is_go {
            Ok(Some(Selected {
                name: req.name,
                handles,
                capabilities: caps,
            }))
        } else {
            self.close_export(handles);
            Ok(None)
        }
    }

    fn send_info(
        &mut self,
        opt: OptType,
        typ: InfoType,
        name: &str,
        handles: &[Handle],
        caps: &Capabilities,
    ) -> Result<()> {
        let mut data = vec![];
        let info_type: u16 = typ.into();
        data.write_u16::<BE>(info_type)?;
        match typ {
            InfoType::EXPORT => {
                data.write_u64::<BE>(caps.size)?;
                data.write_u16::<BE>(caps.to_transmit_flags().bits())?;
            }
            InfoType::NAME => data.write_all(name.as_bytes())?,
            InfoType::DESCRIPTION => {
                let description = self.server.chain.top(handles).export_description()?;
                data.write_all(description.as_bytes())?;
            }
            InfoType::BLOCK_SIZE => {
                data.write_u32::<BE>(caps.block_size_min)?;
                data.write_u32::<BE>(caps.block_size_preferred)?;
                data.write_u32::<BE>(caps.block_size_max)?;
            }
        }
        OptReply::new(opt, ReplyType::INFO, data).put(&mut self.stream)?;
        Ok(())
    }

    fn handle_set_meta_context(&mut self, data: &[u8]) -> Result<()> {
        let req = MetaContextRequest::get(data)?;
        if !self.export_exists(&req.export_name) {
            OptReply::new(OptType::SET_META_CONTEXT, ReplyType::ERR_UNKNOWN, vec![])
                .put(&mut self.stream)?;
            return Ok(());
        }
        self.meta_contexts.clear();
        for query in &req.queries {
            // Only a literal match on base:allocation is implemented;
            // glob queries (e.g. "base:*") match nothing, as documented
            // on `MetaContextRequest`.
            if query == "base:allocation" {
                let id = self.meta_contexts.len() as u32;
                self.meta_contexts.push((id, query.clone()));
                put_meta_context_reply(&mut self.stream, OptType::SET_META_CONTEXT, id, query)?;
            }
        }
        OptReply::ack(OptType::SET_META_CONTEXT).put(&mut self.stream)?;
        Ok(())
    }

    fn handle_list_meta_context(&mut self, data: &[u8]) -> Result<()> {
        let req = MetaContextRequest::get(data)?;
        if !self.export_exists(&req.export_name) {
            OptReply::new(OptType::LIST_META_CONTEXT, ReplyType::ERR_UNKNOWN, vec![])
                .put(&mut self.stream)?;
            return Ok(());
        }
        // an empty query list means "list every context this server
        // supports", which is just base:allocation.
        let offer_all = req.queries.is_empty();
        let matches = offer_all || req.queries.iter().any(|q| q == "base:allocation");
        if matches {
            put_meta_context_reply(
                &mut self.stream,
                OptType::LIST_META_CONTEXT,
                0,
                "base:allocation",
            )?;
        }
        OptReply::ack(OptType::LIST_META_CONTEXT).put(&mut self.stream)?;
        Ok(())
    }

    fn arm_watchdog(&self) {
        let Some(timeout) = self.server.timeout else {
            return;
        };
        let Some(fd) = self.raw_fd else {
            return;
        };
        let my_generation = self.watchdog_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.watchdog_generation);
        let peer = self.peer.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if generation.load(Ordering::SeqCst) == my_generation {
                warn!("{peer}: watchdog fired, shutting down connection");
                let _ = shutdown_write_fd(fd);
            }
        });
    }

    /// Leaving `READY`: invalidate any outstanding timer rather than join
    /// it (§5 — the watchdog never frees memory, the owning thread's own
    /// return path does).
    fn disarm_watchdog(&self) {
        self.watchdog_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn ready_loop(&mut self, selected: Selected) -> Result<()> {
        let Selected {
            name,
            handles,
            capabilities,
        } = selected;
        info!(
            "{}: export {name:?} ready (size={}, writable={})",
            self.peer, capabilities.size, capabilities.writable
        );

        self.arm_watchdog();
        let mut scratch = vec![0u8; MAX_REQUEST_LEN as usize];
        let result = self.dispatch_loop(&handles, &capabilities, &mut scratch);
        self.disarm_watchdog();
        self.close_export(handles);
        result
    }

    fn dispatch_loop(
        &mut self,
        handles: &[Handle],
        caps: &Capabilities,
        scratch: &mut [u8],
    ) -> Result<()> {
        loop {
            let req = match Request::get(&mut self.stream, self.header_mode, scratch) {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!("{}: {err}, closing", self.peer);
                    return Ok(());
                }
            };
            trace!("{}: {:?}", self.peer, req);

            if req.typ == Cmd::DISCONNECT {
                return Ok(());
            }

            self.arm_watchdog();
            let outcome = self
                .server
                .with_chain_lock(|| self.dispatch_one(&req, handles, caps, scratch));
            if let Err(err) = outcome {
                warn!("{}: {err}, closing", self.peer);
                return Ok(());
            }
        }
    }

    /// `offset+len` must stay within the export; used for every op that
    /// takes a byte range (§3).
    fn validate_range(&self, offset: u64, len: u64, caps: &Capabilities) -> Option<ErrorType> {
        if offset.checked_add(len).map_or(true, |end| end > caps.size) {
            return Some(ErrorType::EINVAL);
        }
        None
    }

    fn validate_bounds(&self, req: &Request, caps: &Capabilities) -> Option<ErrorType> {
        if let Some(err) = self.validate_range(req.offset, req.len, caps) {
            return Some(err);
        }
        if req.len > caps.block_size_max as u64 {
            return Some(ErrorType::EINVAL);
        }
        None
    }

    fn dispatch_one(
        &mut self,
        req: &Request,
        handles: &[Handle],
        caps: &Capabilities,
        scratch: &[u8],
    ) -> Result<()> {
        let top = self.server.chain.top(handles);
        match req.typ {
            Cmd::READ => {
                if let Some(err) = self.validate_bounds(req, caps) {
                    return self.reply_error(req, err);
                }
                let mut buf = vec![0u8; req.len as usize];
                match top.pread(&mut buf, req.offset) {
                    Ok(()) => self.reply_read(req, &buf),
                    Err(err) => self.reply_chain_error(req, err),
                }
            }
            Cmd::WRITE => {
                if !caps.writable {
                    return self.reply_error(req, ErrorType::EPERM);
                }
                if let Some(err) = self.validate_bounds(req, caps) {
                    return self.reply_error(req, err);
                }
                let fua = req.flags.contains(CmdFlags::FUA);
                match top.pwrite(&scratch[..req.data_len], req.offset, fua) {
                    Ok(()) => self.reply_ok(req),
                    Err(err) => self.reply_chain_error(req, err),
                }
            }
            Cmd::FLUSH => match top.flush() {
                Ok(()) => self.reply_ok(req),
                Err(err) => self.reply_chain_error(req, err),
            },
            Cmd::TRIM => {
                if !caps.trimmable {
                    return self.reply_error(req, ErrorType::ENOTSUP);
                }
                if let Some(err) = self.validate_range(req.offset, req.len, caps) {
                    return self.reply_error(req, err);
                }
                let fua = req.flags.contains(CmdFlags::FUA);
                match top.trim(req.offset, req.len, fua) {
                    Ok(()) => self.reply_ok(req),
                    Err(err) => self.reply_chain_error(req, err),
                }
            }
            Cmd::CACHE => match top.cache(req.offset, req.len) {
                Ok(()) => self.reply_ok(req),
                Err(err) => self.reply_chain_error(req, err),
            },
            Cmd::WRITE_ZEROES => {
                if !caps.zeroable {
                    return self.reply_error(req, ErrorType::ENOTSUP);
                }
                if req.flags.contains(CmdFlags::FAST_ZERO) && !caps.fast_zero {
                    // §4.4: fail immediately rather than falling back to
                    // a slow zero.
                    return self.reply_error(req, ErrorType::ENOTSUP);
                }
                if let Some(err) = self.validate_range(req.offset, req.len, caps) {
                    return self.reply_error(req, err);
                }
                let fua = req.flags.contains(CmdFlags::FUA);
                let no_hole = req.flags.contains(CmdFlags::NO_HOLE);
                match top.zero(req.offset, req.len, fua, no_hole) {
                    Ok(()) => self.reply_ok(req),
                    Err(err) => self.reply_chain_error(req, err),
                }
            }
            Cmd::BLOCK_STATUS => {
                if !caps.extents || self.meta_contexts.is_empty() {
                    return self.reply_error(req, ErrorType::ENOTSUP);
                }
                if let Some(err) = self.validate_range(req.offset, req.len, caps) {
                    return self.reply_error(req, err);
                }
                let req_one = req.flags.contains(CmdFlags::REQ_ONE);
                match top.extents(req.offset, req.len, req_one) {
                    Ok(extents) => self.reply_block_status(req, &extents, req_one),
                    Err(err) => self.reply_chain_error(req, err),
                }
            }
            Cmd::RESIZE => self.reply_error(req, ErrorType::ENOTSUP),
            Cmd::DISCONNECT => unreachable!("handled by the caller"),
        }
    }

    fn reply_ok(&mut self, req: &Request) -> Result<()> {
        if self.structured_reply {
            StructuredChunk::none(req.handle, true).put(&mut self.stream)?;
        } else {
            SimpleReply::ok(req).put(&mut self.stream)?;
        }
        Ok(())
    }

    fn reply_error(&mut self, req: &Request, err: ErrorType) -> Result<()> {
        if self.structured_reply {
            StructuredChunk::error(req.handle, err, &format!("{err:?}")).put(&mut self.stream)?;
        } else {
            SimpleReply::err(err, req).put(&mut self.stream)?;
        }
        Ok(())
    }

    fn reply_read(&mut self, req: &Request, data: &[u8]) -> Result<()> {
        if self.structured_reply {
            StructuredChunk::offset_data(req.handle, true, req.offset, data)
                .put(&mut self.stream)?;
        } else {
            SimpleReply::data(req, data).put(&mut self.stream)?;
        }
        Ok(())
    }

    fn reply_block_status(
        &mut self,
        req: &Request,
        extents: &[Extent],
        req_one: bool,
    ) -> Result<()> {
        let id = self
            .meta_contexts
            .iter()
            .find(|(_, name)| name == "base:allocation")
            .map(|(id, _)| *id)
            .unwrap_or(0);
        let extents = if req_one && !extents.is_empty() {
            &extents[..1]
        } else {
            extents
        };
        let descriptors: Vec<(u64, u32)> = extents.iter().map(|e| (e.length, e.flags)).collect();
        let entries = vec![(id, descriptors)];
        StructuredChunk::block_status(req.handle, true, &entries).put(&mut self.stream)?;
        Ok(())
    }

    /// Maps a layer's abstract error to its wire code and replies with
    /// it (§7). A `ProtocolViolation`/`Shutdown` kind kills the
    /// connection after the reply goes out.
    fn reply_chain_error(&mut self, req: &Request, err: ChainError) -> Result<()> {
        warn!("{}: {:?} failed: {err}", self.peer, req.typ);
        let fatal = err.kind().is_fatal();
        self.reply_error(req, err.kind().to_wire())?;
        if fatal {
            bail!(ProtocolError::new(format!("fatal chain error: {err}")));
        }
        Ok(())
    }
}
