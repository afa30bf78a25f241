//! Fixed limits of the streaming core.

/// Maximum number of transfer objects (and buffers) one data stream owns.
pub const MAX_URBS_PER_STREAM: usize = 10;

/// Maximum number of DVB adapters one USB device exposes.
pub const MAX_ADAPTERS_PER_DEVICE: usize = 2;

/// Maximum number of frontend slots per adapter.
pub const MAX_FRONTENDS_PER_ADAPTER: usize = 3;

/// Demux feed limit when the adapter filters in software.
pub const SOFTWARE_MAX_FEEDS: usize = 255;

/// Highest valid MPEG-TS PID (13 bits).
pub const MAX_PID: u16 = 0x1FFF;

/// Default remote-control polling interval in milliseconds.
pub const DEFAULT_RC_INTERVAL_MS: u64 = 150;
