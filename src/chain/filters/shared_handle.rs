//! Share one open handle across every connection to the same export.
//!
//! Ported from nbdkit's `filters/openonce/openonce.c`: normally each
//! connection gets its own handle from the layer below, opened and closed
//! independently. This filter instead opens the chain beneath it exactly
//! once — on the first connection — and every later connection reuses
//! that same handle, forwarding straight to it instead of going through a
//! fresh `next` of its own. `openonce.c` keeps a list keyed by
//! `(readonly, exportname)`; this port is scoped to a single export per
//! filter instance, so the key collapses to just `readonly`.
//!
//! Structurally this means `SharedHandleFilter` can't be "just another
//! layer" threaded through the usual [`Next`] forwarding: the chain
//! beneath it needs to be opened once and kept alive for the life of the
//! process, not re-opened per connection by [`crate::chain::Chain::open`].
//! So it owns that sub-chain directly and is meant to be pushed as the
//! last (innermost) layer in the outer `ChainBuilder` — from the outer
//! chain's point of view it behaves like a plugin.

use std::sync::{Arc, Mutex};

use crate::capability::{CacheLevel, FuaLevel};
use crate::chain::{BlockSize, Chain, Extent, Handle, Layer, Next, ThreadModel};
use crate::error::Result;

struct Shared {
    handles: Vec<Handle>,
}

/// Wraps a sub-chain (typically just a single plugin, but any chain works)
/// and opens it exactly once regardless of how many connections arrive.
pub struct SharedHandleFilter {
    inner: Chain,
    readonly_shared: Mutex<Option<Arc<Shared>>>,
    writable_shared: Mutex<Option<Arc<Shared>>>,
}

impl SharedHandleFilter {
    pub fn new(inner: Chain) -> Self {
        SharedHandleFilter {
            inner,
            readonly_shared: Mutex::new(None),
            writable_shared: Mutex::new(None),
        }
    }

    fn slot(&self, readonly: bool) -> &Mutex<Option<Arc<Shared>>> {
        if readonly {
            &self.readonly_shared
        } else {
            &self.writable_shared
        }
    }

    fn shared(&self, readonly: bool) -> Result<Arc<Shared>> {
        let mut slot = self.slot(readonly).lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let handles = self.inner.open(readonly)?;
        self.inner.top(&handles).prepare()?;
        let shared = Arc::new(Shared { handles });
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    fn top<'a>(&'a self, shared: &'a Shared) -> Next<'a> {
        self.inner.top(&shared.handles)
    }
}

impl Layer for SharedHandleFilter {
    fn name(&self) -> &str {
        "shared_handle"
    }

    fn thread_model(&self) -> ThreadModel {
        self.inner.thread_model()
    }

    fn shared_state(&self) -> bool {
        true
    }

    fn open(&self, _next: &Next, readonly: bool) -> Result<Handle> {
        Ok(Handle::new(self.shared(readonly)?))
    }

    fn close(&self, _next: &Next, _handle: Handle) {
        // The shared handle outlives every individual connection; it's
        // torn down only when the filter itself is dropped at shutdown,
        // not here. Nothing to do per-connection.
    }

    fn prepare(&self, _next: &Next, _handle: &Handle) -> Result<()> {
        // Already done once inside `shared()` when the handle was created.
        Ok(())
    }

    fn finalize(&self, _next: &Next, handle: &Handle) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).finalize()
    }

    fn get_size(&self, _next: &Next, handle: &Handle) -> Result<u64> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).get_size()
    }

    fn block_size(&self, _next: &Next, handle: &Handle) -> Result<BlockSize> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).block_size()
    }

    fn export_description(&self, _next: &Next, handle: &Handle) -> Result<String> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).export_description()
    }

    fn can_write(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_write()
    }

    fn can_flush(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_flush()
    }

    fn can_trim(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_trim()
    }

    fn can_zero(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_zero()
    }

    fn can_fast_zero(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_fast_zero()
    }

    fn can_multi_conn(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_multi_conn()
    }

    fn can_extents(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).can_extents()
    }

    fn cache_level(&self, _next: &Next, handle: &Handle) -> Result<CacheLevel> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).cache_level()
    }

    fn fua_level(&self, _next: &Next, handle: &Handle) -> Result<FuaLevel> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).fua_level()
    }

    fn is_rotational(&self, _next: &Next, handle: &Handle) -> Result<bool> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).is_rotational()
    }

    fn pread(&self, _next: &Next, handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).pread(buf, offset)
    }

    fn pwrite(
        &self,
        _next: &Next,
        handle: &Handle,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).pwrite(buf, offset, fua)
    }

    fn trim(&self, _next: &Next, handle: &Handle, offset: u64, len: u64, fua: bool) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).trim(offset, len, fua)
    }

    fn zero(
        &self,
        _next: &Next,
        handle: &Handle,
        offset: u64,
        len: u64,
        fua: bool,
        no_hole: bool,
    ) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).zero(offset, len, fua, no_hole)
    }

    fn flush(&self, _next: &Next, handle: &Handle) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).flush()
    }

    fn cache(&self, _next: &Next, handle: &Handle, offset: u64, len: u64) -> Result<()> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).cache(offset, len)
    }

    fn extents(
        &self,
        _next: &Next,
        handle: &Handle,
        offset: u64,
        len: u64,
        req_one: bool,
    ) -> Result<Vec<Extent>> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).extents(offset, len, req_one)
    }

    fn list_exports(&self, _next: &Next, handle: &Handle) -> Result<Vec<String>> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).list_exports()
    }

    fn default_export(&self, _next: &Next, handle: &Handle) -> Result<String> {
        let shared = handle.downcast_ref::<Arc<Shared>>();
        self.top(shared).default_export()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::plugin::MemoryPlugin;
    use crate::chain::ChainBuilder;
    use std::sync::Arc as StdArc;

    fn inner_chain(writable: bool) -> Chain {
        ChainBuilder::new()
            .push(StdArc::new(MemoryPlugin::new(vec![0u8; 64], writable)))
            .build()
            .unwrap()
    }

    #[test]
    fn two_connections_see_the_same_writes() {
        let filter = SharedHandleFilter::new(inner_chain(true));
        let chain = ChainBuilder::new().push(StdArc::new(filter)).build().unwrap();

        let conn_a = chain.open(false).unwrap();
        chain.top(&conn_a).pwrite(&[7; 4], 0, false).unwrap();
        chain.close(conn_a);

        let conn_b = chain.open(false).unwrap();
        let mut buf = [0u8; 4];
        chain.top(&conn_b).pread(&mut buf, 0).unwrap();
        assert_eq!(buf, [7; 4]);
        chain.close(conn_b);
    }

    #[test]
    fn declares_shared_state_and_tightens_thread_model() {
        let filter = SharedHandleFilter::new(inner_chain(false));
        assert!(filter.shared_state());
    }
}
