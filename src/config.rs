/// Environment variable read by [`AllocatorConfig::from_env`] to turn the
/// diagnostic channel on.
pub const DIAGNOSTICS_ENV_VAR: &str = "SLAB_SUBALLOC_DIAGNOSTICS";

/// What kind of resource an allocation backs.
///
/// This only influences how large a slab is created when no existing slab has
/// room: buffers tend to be small and numerous, images large and few.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A buffer. Uses [`AllocatorConfig::buffer_block_size`].
    #[default]
    Buffer,
    /// An image. Uses [`AllocatorConfig::image_block_size`].
    Image,
    /// Any other resource, with an explicit slab-size hint in bytes.
    Custom(u64),
}

/// Configuration for a [`SlabAllocator`](crate::SlabAllocator).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Emit a [`DiagnosticEvent`](crate::DiagnosticEvent) for every allocate,
    /// free, bind, and unbind.
    pub diagnostics: bool,

    /// Minimum size of a slab created for a buffer allocation.
    pub buffer_block_size: u64,

    /// Minimum size of a slab created for an image allocation.
    pub image_block_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            diagnostics: false,
            buffer_block_size: 1 << 20,
            image_block_size: 64 << 20,
        }
    }
}

impl AllocatorConfig {
    /// The default configuration, with `diagnostics` overridden by the
    /// `SLAB_SUBALLOC_DIAGNOSTICS` environment variable when it is set.
    pub fn from_env() -> Self {
        let mut config = AllocatorConfig::default();
        if let Some(on) = std::env::var(DIAGNOSTICS_ENV_VAR)
            .ok()
            .as_deref()
            .and_then(parse_flag)
        {
            config.diagnostics = on;
        }
        config
    }

    /// Set whether diagnostics are emitted.
    pub fn with_diagnostics(mut self, diagnostics: bool) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Set the slab-size hint for buffers.
    pub fn with_buffer_block_size(mut self, bytes: u64) -> Self {
        self.buffer_block_size = bytes;
        self
    }

    /// Set the slab-size hint for images.
    pub fn with_image_block_size(mut self, bytes: u64) -> Self {
        self.image_block_size = bytes;
        self
    }

    /// The slab-size hint for the given kind of resource.
    pub fn block_size(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Buffer => self.buffer_block_size,
            ResourceKind::Image => self.image_block_size,
            ResourceKind::Custom(bytes) => bytes,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" | "" => Some(false),
        other => {
            log::warn!("ignoring unrecognized {DIAGNOSTICS_ENV_VAR} value {other:?}");
            None
        }
    }
}
