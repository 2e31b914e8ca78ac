//! Tunables for the allocator, symbol table and call stack

/// Settings for a [`crate::runtime::Runtime`] and the parts it owns.
///
/// Defaults match the constants the runtime has always used; the
/// builder methods exist mainly so tests can provoke growth, bias
/// resets and collection requests with small inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Bytes that may be granted before a collection is requested
    pub ballast: usize,
    /// Head slack (in elements) tolerated before a head removal
    /// moves the data back to the start of the buffer
    pub max_bias: u32,
    /// Number of recently expanded series remembered for doubling
    pub expand_ring: usize,
    /// Initial size of the symbol hash index (rounded up to a prime)
    pub symbol_capacity: usize,
    /// Maximum number of live activations on the call stack
    pub max_call_depth: usize,
    /// Rounding for buffers served by the system pool
    pub system_align: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings {
            ballast: 3_000_000,
            max_bias: 0x1000,
            expand_ring: 8,
            symbol_capacity: 1024,
            max_call_depth: 10_000,
            system_align: 2048,
        }
    }
}

impl RuntimeSettings {
    pub fn with_ballast(mut self, ballast: usize) -> Self {
        self.ballast = ballast;
        self
    }

    pub fn with_max_bias(mut self, max_bias: u32) -> Self {
        self.max_bias = max_bias;
        self
    }

    pub fn with_expand_ring(mut self, expand_ring: usize) -> Self {
        self.expand_ring = expand_ring.max(1);
        self
    }

    pub fn with_symbol_capacity(mut self, symbol_capacity: usize) -> Self {
        self.symbol_capacity = symbol_capacity;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    /// Alignment must be a power of two; anything else is rounded up
    pub fn with_system_align(mut self, system_align: usize) -> Self {
        self.system_align = system_align.max(16).next_power_of_two();
        self
    }
}
