//! Force a chain read-only regardless of what the layer below supports.
//!
//! Ported from nbdkit's `filters/readonly/readonly.c`: the plugin
//! underneath may well be writable, but this filter clamps every
//! write-adjacent capability to false and rejects the write-shaped ops
//! outright, rather than relying on the client to have noticed the
//! advertised flags.

use crate::chain::{Extent, Handle, Layer, Next};
use crate::error::{ChainError, Result};

/// A filter that makes the export beneath it appear read-only. This is
/// the canonical example from §4.1 of "a filter overriding a capability
/// query independent of the layer below": `can_write` always answers
/// `false` here even if the plugin would have said `true`.
pub struct ReadOnlyFilter;

impl ReadOnlyFilter {
    pub fn new() -> Self {
        ReadOnlyFilter
    }
}

impl Default for ReadOnlyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for ReadOnlyFilter {
    fn name(&self) -> &str {
        "readonly"
    }

    fn can_write(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(false)
    }

    fn can_trim(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(false)
    }

    fn can_zero(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(false)
    }

    fn can_fast_zero(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(false)
    }

    fn pwrite(
        &self,
        _next: &Next,
        _handle: &Handle,
        _buf: &[u8],
        _offset: u64,
        _fua: bool,
    ) -> Result<()> {
        Err(ChainError::read_only("export is read-only (readonly filter)"))
    }

    fn trim(&self, _next: &Next, _handle: &Handle, _offset: u64, _len: u64, _fua: bool) -> Result<()> {
        Err(ChainError::read_only("export is read-only (readonly filter)"))
    }

    fn zero(
        &self,
        _next: &Next,
        _handle: &Handle,
        _offset: u64,
        _len: u64,
        _fua: bool,
        _no_hole: bool,
    ) -> Result<()> {
        Err(ChainError::read_only("export is read-only (readonly filter)"))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::plugin::MemoryPlugin;
    use crate::chain::ChainBuilder;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    #[test]
    fn forces_read_only_over_a_writable_plugin() {
        let chain = ChainBuilder::new()
            .push(Arc::new(ReadOnlyFilter::new()))
            .push(Arc::new(MemoryPlugin::new(vec![0u8; 16], true)))
            .build()
            .unwrap();
        let handles = chain.open(false).unwrap();
        let caps = chain.capabilities(&handles).unwrap();
        assert!(!caps.writable);

        let top = chain.top(&handles);
        let err = top.pwrite(&[1, 2, 3], 0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
        chain.close(handles);
    }
}
