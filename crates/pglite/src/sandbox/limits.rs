use tracing::warn;
use wasmtime::ResourceLimiter;

/// Caps guest linear memory and records the high-water mark.
pub struct GuestLimits {
    max_memory: usize,
    peak_memory: usize,
}

impl GuestLimits {
    pub const fn new(max_memory: Option<usize>) -> Self {
        Self {
            max_memory: match max_memory {
                Some(max) => max,
                None => usize::MAX,
            },
            peak_memory: 0,
        }
    }

    pub const fn peak_memory(&self) -> usize {
        self.peak_memory
    }
}

impl ResourceLimiter for GuestLimits {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory {
            warn!(
                current,
                desired,
                max = self.max_memory,
                "guest memory growth denied"
            );
            return Ok(false);
        }
        self.peak_memory = self.peak_memory.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(true)
    }
}
