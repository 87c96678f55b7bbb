//! Chain builder and layer invocation runtime (§4.1, §4.3).
//!
//! A chain is a fixed stack of [`Layer`] values, filters first and the
//! terminal plugin last. Each layer sees the rest of the chain only
//! through a [`Next`] handle, which hides whether the thing below it is
//! another filter or the plugin. A layer that doesn't override an
//! operation inherits the trait's default, which just forwards to
//! `next` — that's the whole composability trick; there's no separate
//! "is this implemented" registry to keep in sync.

pub mod filters;
pub mod plugin;

use std::any::Any;
use std::sync::Arc;

use crate::capability::{CacheLevel, Capabilities, FuaLevel};
use crate::error::{ChainError, ErrorKind, Result};

/// A single extent in a `BLOCK_STATUS` reply: a run of `length` bytes
/// starting at `offset` sharing one status-flags value (bit 0 = hole,
/// bit 1 = zero, per `base:allocation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

/// Preferred/min/max block sizes a layer recommends to the client via
/// `NBD_INFO_BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    pub min: u32,
    pub preferred: u32,
    pub max: u32,
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize {
            min: 1,
            preferred: 4096,
            max: 32 * 1024 * 1024,
        }
    }
}

/// The chain-wide concurrency contract a layer is willing to run under,
/// ordered weakest-restriction-last. The chain's effective model is the
/// *minimum* (most restrictive) declared by any layer (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadModel {
    SerializeConnections,
    SerializeAllRequests,
    SerializeRequests,
    Parallel,
}

impl ThreadModel {
    /// Fold in one more layer's declared model plus whether it shares
    /// state across connections, applying the §4.3 tightening rule.
    fn fold(self, declared: ThreadModel, shared_state: bool) -> ThreadModel {
        let combined = self.min(declared);
        if shared_state && combined == ThreadModel::SerializeRequests {
            ThreadModel::SerializeAllRequests
        } else {
            combined
        }
    }
}

/// Opaque per-connection state produced by a layer's `open` and handed
/// back to every later call on that layer for that connection.
pub struct Handle(Box<dyn Any + Send + Sync>);

impl Handle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Handle(Box::new(value))
    }

    /// The handle carried by a layer with no per-connection state of its
    /// own (most filters: they only hold process-wide config).
    pub fn unit() -> Self {
        Handle::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> &T {
        self.0
            .downcast_ref()
            .expect("layer handle type mismatch — chain built inconsistently")
    }

    pub fn downcast_mut<T: Any>(&mut self) -> &mut T {
        self.0
            .downcast_mut()
            .expect("layer handle type mismatch — chain built inconsistently")
    }
}

fn no_layer(op: &str) -> ChainError {
    ChainError::new(
        ErrorKind::NotSupported,
        format!("no layer in the chain implements {op}"),
    )
}

/// View of "everything below this layer", threading both the remaining
/// layer stack and its matching per-connection handles in lockstep.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Layer>],
    handles: &'a [Handle],
}

impl<'a> Next<'a> {
    pub fn new(layers: &'a [Arc<dyn Layer>], handles: &'a [Handle]) -> Self {
        debug_assert_eq!(layers.len(), handles.len());
        Next { layers, handles }
    }

    fn step(&self) -> Option<(&'a dyn Layer, &'a Handle, Next<'a>)> {
        let (layer, rest_layers) = self.layers.split_first()?;
        let (handle, rest_handles) = self.handles.split_first()?;
        Some((
            layer.as_ref(),
            handle,
            Next {
                layers: rest_layers,
                handles: rest_handles,
            },
        ))
    }

    pub fn open(&self, readonly: bool) -> Result<Handle> {
        match self.step() {
            Some((layer, _, rest)) => layer.open(&rest, readonly),
            None => Ok(Handle::unit()),
        }
    }

    pub fn prepare(&self) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.prepare(&rest, handle),
            None => Ok(()),
        }
    }

    pub fn finalize(&self) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.finalize(&rest, handle),
            None => Ok(()),
        }
    }

    pub fn get_size(&self) -> Result<u64> {
        match self.step() {
            Some((layer, handle, rest)) => layer.get_size(&rest, handle),
            None => Err(no_layer("get_size")),
        }
    }

    pub fn block_size(&self) -> Result<BlockSize> {
        match self.step() {
            Some((layer, handle, rest)) => layer.block_size(&rest, handle),
            None => Ok(BlockSize::default()),
        }
    }

    pub fn export_description(&self) -> Result<String> {
        match self.step() {
            Some((layer, handle, rest)) => layer.export_description(&rest, handle),
            None => Ok(String::new()),
        }
    }

    pub fn can_write(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_write(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_flush(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_flush(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_trim(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_trim(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_zero(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_zero(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_fast_zero(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_fast_zero(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_multi_conn(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_multi_conn(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn can_extents(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.can_extents(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn cache_level(&self) -> Result<CacheLevel> {
        match self.step() {
            Some((layer, handle, rest)) => layer.cache_level(&rest, handle),
            None => Ok(CacheLevel::None),
        }
    }

    pub fn fua_level(&self) -> Result<FuaLevel> {
        match self.step() {
            Some((layer, handle, rest)) => layer.fua_level(&rest, handle),
            None => Ok(FuaLevel::Emulate),
        }
    }

    pub fn is_rotational(&self) -> Result<bool> {
        match self.step() {
            Some((layer, handle, rest)) => layer.is_rotational(&rest, handle),
            None => Ok(false),
        }
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.pread(&rest, handle, buf, offset),
            None => Err(no_layer("pread")),
        }
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64, fua: bool) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.pwrite(&rest, handle, buf, offset, fua),
            None => Err(no_layer("pwrite")),
        }
    }

    pub fn trim(&self, offset: u64, len: u64, fua: bool) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.trim(&rest, handle, offset, len, fua),
            None => Err(ChainError::new(ErrorKind::NotSupported, "trim")),
        }
    }

    pub fn zero(&self, offset: u64, len: u64, fua: bool, no_hole: bool) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.zero(&rest, handle, offset, len, fua, no_hole),
            None => Err(ChainError::new(ErrorKind::NotSupported, "zero")),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.flush(&rest, handle),
            None => Ok(()),
        }
    }

    pub fn cache(&self, offset: u64, len: u64) -> Result<()> {
        match self.step() {
            Some((layer, handle, rest)) => layer.cache(&rest, handle, offset, len),
            None => Ok(()),
        }
    }

    pub fn extents(&self, offset: u64, len: u64, req_one: bool) -> Result<Vec<Extent>> {
        match self.step() {
            Some((layer, handle, rest)) => layer.extents(&rest, handle, offset, len, req_one),
            None => Err(ChainError::new(ErrorKind::NotSupported, "extents")),
        }
    }

    pub fn close(&self, handle: Handle) {
        if let Some((layer, _, rest)) = self.step() {
            layer.close(&rest, handle);
        }
    }

    pub fn list_exports(&self) -> Result<Vec<String>> {
        match self.step() {
            Some((layer, handle, rest)) => layer.list_exports(&rest, handle),
            None => Ok(vec![]),
        }
    }

    pub fn default_export(&self) -> Result<String> {
        match self.step() {
            Some((layer, handle, rest)) => layer.default_export(&rest, handle),
            None => Ok(String::new()),
        }
    }
}

/// A node in a chain. Implement only the operations this layer actually
/// changes; everything else inherits the "forward to next" default.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    /// Strongest serialization this layer requires (§4.3). Most filters
    /// are `Parallel`; override when the layer holds intrinsically
    /// single-threaded state (see the indexed-decompression layer).
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    /// Whether this layer shares one handle/state object across every
    /// connection rather than opening one per connection. Tightens the
    /// chain's effective thread model per §4.3's rule.
    fn shared_state(&self) -> bool {
        false
    }

    /// A layer with no per-connection state of its own doesn't need to
    /// call `next.open()` here: [`Chain::open`] already opens every layer
    /// below independently, so the default just carries nothing. (Calling
    /// `next.open()` from here would re-open everything below a second
    /// time, since the chain builder's own recursion already did it.)
    fn open(&self, _next: &Next, _readonly: bool) -> Result<Handle> {
        Ok(Handle::unit())
    }

    fn prepare(&self, next: &Next, _handle: &Handle) -> Result<()> {
        next.prepare()
    }

    fn finalize(&self, next: &Next, _handle: &Handle) -> Result<()> {
        next.finalize()
    }

    /// See [`Layer::open`]: a layer with no state of its own has nothing
    /// to do here either, since [`Chain::close`] drops every layer's real
    /// handle directly.
    fn close(&self, _next: &Next, _handle: Handle) {}

    fn get_size(&self, next: &Next, _handle: &Handle) -> Result<u64> {
        next.get_size()
    }

    fn block_size(&self, next: &Next, _handle: &Handle) -> Result<BlockSize> {
        next.block_size()
    }

    fn export_description(&self, next: &Next, _handle: &Handle) -> Result<String> {
        next.export_description()
    }

    fn can_write(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_write()
    }

    fn can_flush(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_flush()
    }

    fn can_trim(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_trim()
    }

    fn can_zero(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_zero()
    }

    fn can_fast_zero(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_fast_zero()
    }

    fn can_multi_conn(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_multi_conn()
    }

    fn can_extents(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.can_extents()
    }

    fn cache_level(&self, next: &Next, _handle: &Handle) -> Result<CacheLevel> {
        next.cache_level()
    }

    fn fua_level(&self, next: &Next, _handle: &Handle) -> Result<FuaLevel> {
        next.fua_level()
    }

    fn is_rotational(&self, next: &Next, _handle: &Handle) -> Result<bool> {
        next.is_rotational()
    }

    fn pread(&self, next: &Next, _handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        next.pread(buf, offset)
    }

    fn pwrite(
        &self,
        next: &Next,
        _handle: &Handle,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> Result<()> {
        next.pwrite(buf, offset, fua)
    }

    fn trim(&self, next: &Next, _handle: &Handle, offset: u64, len: u64, fua: bool) -> Result<()> {
        next.trim(offset, len, fua)
    }

    fn zero(
        &self,
        next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        fua: bool,
        no_hole: bool,
    ) -> Result<()> {
        next.zero(offset, len, fua, no_hole)
    }

    fn flush(&self, next: &Next, _handle: &Handle) -> Result<()> {
        next.flush()
    }

    fn cache(&self, next: &Next, _handle: &Handle, offset: u64, len: u64) -> Result<()> {
        next.cache(offset, len)
    }

    fn extents(
        &self,
        next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        req_one: bool,
    ) -> Result<Vec<Extent>> {
        next.extents(offset, len, req_one)
    }

    fn list_exports(&self, next: &Next, _handle: &Handle) -> Result<Vec<String>> {
        next.list_exports()
    }

    fn default_export(&self, next: &Next, _handle: &Handle) -> Result<String> {
        next.default_export()
    }
}

/// A fixed, ordered stack of layers with the plugin last. Built once at
/// startup by [`ChainBuilder`] and shared (read-only) by every
/// connection for the process's lifetime.
pub struct Chain {
    layers: Vec<Arc<dyn Layer>>,
    thread_model: ThreadModel,
}

impl Chain {
    pub fn thread_model(&self) -> ThreadModel {
        self.thread_model
    }

    pub fn layers(&self) -> &[Arc<dyn Layer>] {
        &self.layers
    }

    /// Open one per-connection handle per layer, bottom-up, returning
    /// them top-first so index 0 lines up with `layers()[0]`.
    pub fn open(&self, readonly: bool) -> Result<Vec<Handle>> {
        let mut handles = Vec::with_capacity(self.layers.len());
        // build bottom-up: open() is naturally recursive via Next, so we
        // drive it by asking layer 0's open, which recurses through Next
        // down to the terminal empty Next.
        self.open_from(0, readonly, &mut handles)?;
        Ok(handles)
    }

    fn open_from(&self, index: usize, readonly: bool, out: &mut Vec<Handle>) -> Result<()> {
        if index == self.layers.len() {
            return Ok(());
        }
        // We can't build `Next` for layers[index+1..] until we have the
        // handles for them, so recurse depth-first and then unwind,
        // pushing each layer's own handle once its "next" is ready.
        let mut below = Vec::new();
        self.open_from(index + 1, readonly, &mut below)?;
        let next = Next::new(&self.layers[index + 1..], &below);
        let handle = self.layers[index].open(&next, readonly)?;
        out.push(handle);
        out.extend(below);
        Ok(())
    }

    /// A `Next` view of the whole chain, for the dispatcher to call
    /// top-of-chain operations through.
    pub fn top<'a>(&'a self, handles: &'a [Handle]) -> Next<'a> {
        Next::new(&self.layers, handles)
    }

    pub fn close(&self, mut handles: Vec<Handle>) {
        // tear down top-down: the top layer's close may still need to
        // call next.close(), forming the same recursive shape as open.
        self.close_from(0, &mut handles);
    }

    fn close_from(&self, index: usize, handles: &mut Vec<Handle>) {
        if index >= self.layers.len() || handles.is_empty() {
            return;
        }
        let handle = handles.remove(0);
        let next = Next::new(&self.layers[index + 1..], handles);
        self.layers[index].close(&next, handle);
    }

    /// Compute the effective capability set for this chain, per §4.1/§3:
    /// a fresh per-connection handle set is opened just to ask, then
    /// closed. Callers (the connection state machine) memoize the
    /// result per (connection, export).
    pub fn capabilities(&self, handles: &[Handle]) -> Result<Capabilities> {
        let top = self.top(handles);
        let size = top.get_size()?;
        let mut caps = Capabilities::minimal(size);
        caps.writable = top.can_write()?;
        caps.flushable = top.can_flush()?;
        caps.trimmable = top.can_trim()?;
        caps.zeroable = top.can_zero()?;
        caps.fast_zero = caps.zeroable && top.can_fast_zero()?;
        caps.fua_level = top.fua_level()?;
        caps.cache_level = top.cache_level()?;
        caps.extents = top.can_extents()?;
        caps.multi_conn = top.can_multi_conn()?;
        caps.rotational = top.is_rotational()?;
        let block_size = top.block_size()?;
        caps.block_size_min = block_size.min;
        caps.block_size_preferred = block_size.preferred;
        caps.block_size_max = block_size.max;
        Ok(caps)
    }
}

/// Assembles a fixed layer stack into a [`Chain`], computing the
/// effective thread model by folding every layer's declared model
/// (§4.3).
pub struct ChainBuilder {
    layers: Vec<Arc<dyn Layer>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        ChainBuilder { layers: Vec::new() }
    }

    /// Append a layer; layers are applied client-facing-first, so the
    /// first one pushed sits closest to the client and the last one
    /// pushed should be the plugin.
    pub fn push(mut self, layer: Arc<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn build(self) -> Result<Chain> {
        if self.layers.is_empty() {
            return Err(ChainError::new(
                ErrorKind::InvalidRequest,
                "a chain needs at least a plugin",
            ));
        }
        let thread_model = self
            .layers
            .iter()
            .fold(ThreadModel::Parallel, |acc, layer| {
                acc.fold(layer.thread_model(), layer.shared_state())
            });
        Ok(Chain {
            layers: self.layers,
            thread_model,
        })
    }
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::plugin::MemoryPlugin;

    #[test]
    fn single_plugin_chain_reports_its_size() {
        let plugin = Arc::new(MemoryPlugin::new(vec![0u8; 4096], true));
        let chain = ChainBuilder::new().push(plugin).build().unwrap();
        let handles = chain.open(false).unwrap();
        let caps = chain.capabilities(&handles).unwrap();
        assert_eq!(caps.size, 4096);
        assert!(caps.writable);
        chain.close(handles);
    }

    #[test]
    fn thread_model_tightens_for_shared_state_filter() {
        struct SharedFilter;
        impl Layer for SharedFilter {
            fn name(&self) -> &str {
                "shared"
            }
            fn thread_model(&self) -> ThreadModel {
                ThreadModel::SerializeRequests
            }
            fn shared_state(&self) -> bool {
                true
            }
        }
        struct ParallelFilter;
        impl Layer for ParallelFilter {
            fn name(&self) -> &str {
                "parallel"
            }
        }

        let chain = ChainBuilder::new()
            .push(Arc::new(ParallelFilter))
            .push(Arc::new(SharedFilter))
            .push(Arc::new(MemoryPlugin::new(vec![0u8; 16], true)))
            .build()
            .unwrap();
        assert_eq!(chain.thread_model(), ThreadModel::SerializeAllRequests);
    }
}
