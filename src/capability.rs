//! Per-export capability negotiation.
//!
//! A chain's capabilities are computed bottom-up from the plugin and
//! memoized once per (connection, export) pair the first time any layer
//! asks for them; nothing in the chain re-derives them per request. See
//! [`crate::chain::Next`] for how a filter overrides what it inherits from
//! the layer below it.

use crate::proto::TransmitFlags;

/// FUA (force unit access) support level a layer can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FuaLevel {
    /// The backend has no concept of FUA; the dispatcher must emulate it
    /// with an explicit flush after the op.
    Emulate,
    /// The backend can honor FUA natively on this op.
    Native,
}

/// `NBD_CMD_CACHE` support level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheLevel {
    None,
    /// Prefetch via ordinary reads into the page cache.
    Emulate,
    Native,
}

/// The capability set of an export, as seen from the top of a chain.
///
/// Constructed by folding each layer's `prepare`/override over the layer
/// below it, starting from the plugin at the bottom (§4.1, §4.3). Once
/// computed for a given connection+export it's cached verbatim; a filter
/// that depends on read-time state (like `readonly`) participates by
/// clamping at chain-build time, not per request.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub size: u64,
    pub writable: bool,
    pub flushable: bool,
    pub trimmable: bool,
    pub zeroable: bool,
    pub fast_zero: bool,
    pub fua_level: FuaLevel,
    pub cache_level: CacheLevel,
    pub extents: bool,
    pub multi_conn: bool,
    pub rotational: bool,
    pub block_size_min: u32,
    pub block_size_preferred: u32,
    pub block_size_max: u32,
}

impl Capabilities {
    /// The capability set of a freshly opened plugin with every optional
    /// feature absent; a plugin implementation starts here and a filter
    /// starts from whatever the layer below it returns.
    pub fn minimal(size: u64) -> Self {
        Capabilities {
            size,
            writable: false,
            flushable: false,
            trimmable: false,
            zeroable: false,
            fast_zero: false,
            fua_level: FuaLevel::Emulate,
            cache_level: CacheLevel::None,
            extents: false,
            multi_conn: false,
            rotational: false,
            block_size_min: 1,
            block_size_preferred: 4096,
            block_size_max: 32 * 1024 * 1024,
        }
    }

    /// Translate to the wire-level `NBD_FLAG_*` bits sent in the
    /// transmission-flags field of `NBD_OPT_EXPORT_NAME` / `NBD_INFO_EXPORT`
    /// replies.
    pub fn to_transmit_flags(&self) -> TransmitFlags {
        let mut flags = TransmitFlags::HAS_FLAGS;
        if !self.writable {
            flags |= TransmitFlags::READ_ONLY;
        }
        if self.flushable {
            flags |= TransmitFlags::SEND_FLUSH;
        }
        if self.fua_level != FuaLevel::Emulate || self.flushable {
            // FUA can always be accepted when a flush is available to
            // emulate it with, even if the backend has no native support.
            flags |= TransmitFlags::SEND_FUA;
        }
        if self.rotational {
            flags |= TransmitFlags::ROTATIONAL;
        }
        if self.trimmable {
            flags |= TransmitFlags::SEND_TRIM;
        }
        if self.zeroable {
            flags |= TransmitFlags::SEND_WRITE_ZEROES;
            if self.fast_zero {
                flags |= TransmitFlags::SEND_FAST_ZERO;
            }
        }
        if self.extents {
            flags |= TransmitFlags::SEND_DF;
        }
        if self.multi_conn {
            flags |= TransmitFlags::CAN_MULTI_CONN;
        }
        if self.cache_level != CacheLevel::None {
            flags |= TransmitFlags::SEND_CACHE;
        }
        flags
    }

    /// Clamp every write-adjacent capability to false; used by filters
    /// like `readonly` that force a chain read-only regardless of what's
    /// beneath them.
    pub fn force_read_only(&mut self) {
        self.writable = false;
        self.trimmable = false;
        self.zeroable = false;
        self.fast_zero = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_capabilities_advertise_read_only() {
        let caps = Capabilities::minimal(1024);
        let flags = caps.to_transmit_flags();
        assert!(flags.contains(TransmitFlags::READ_ONLY));
        assert!(flags.contains(TransmitFlags::HAS_FLAGS));
        assert!(!flags.contains(TransmitFlags::SEND_TRIM));
    }

    #[test]
    fn force_read_only_clears_write_capabilities() {
        let mut caps = Capabilities::minimal(1024);
        caps.writable = true;
        caps.trimmable = true;
        caps.zeroable = true;
        caps.fast_zero = true;
        caps.force_read_only();
        assert!(!caps.writable);
        assert!(!caps.trimmable);
        assert!(!caps.zeroable);
        assert!(!caps.fast_zero);
    }
}
