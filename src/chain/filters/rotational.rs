//! Force `is_rotational` to a fixed, configured value.
//!
//! Ported from nbdkit's `filters/rotational/rotational.c`: no data-path
//! code at all, just a capability override, which makes it the simplest
//! possible filter for exercising the chain builder (§4.1) in tests.

use crate::chain::{Handle, Layer, Next};
use crate::error::Result;

/// Overrides `is_rotational` with a fixed value, ignoring whatever the
/// layer below reports.
pub struct RotationalFilter {
    rotational: bool,
}

impl RotationalFilter {
    pub fn new(rotational: bool) -> Self {
        RotationalFilter { rotational }
    }
}

impl Layer for RotationalFilter {
    fn name(&self) -> &str {
        "rotational"
    }

    fn is_rotational(&self, _next: &Next, _handle: &Handle) -> Result<bool> {
        Ok(self.rotational)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::plugin::MemoryPlugin;
    use crate::chain::ChainBuilder;
    use std::sync::Arc;

    #[test]
    fn overrides_rotational_regardless_of_plugin() {
        let chain = ChainBuilder::new()
            .push(Arc::new(RotationalFilter::new(true)))
            .push(Arc::new(MemoryPlugin::new(vec![0u8; 16], true)))
            .build()
            .unwrap();
        let handles = chain.open(false).unwrap();
        let caps = chain.capabilities(&handles).unwrap();
        assert!(caps.rotational);
        chain.close(handles);
    }
}
