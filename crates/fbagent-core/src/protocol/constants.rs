//! Fastboot wire protocol constants.

// ============================================================================
// Framing
// ============================================================================

/// Size of a command frame read from the host.
pub const COMMAND_FRAME_SIZE: usize = 64;
/// Maximum size of an `OKAY`/`FAIL`/`DATA` response.
pub const MAX_RESPONSE_SIZE: usize = 64;
/// Maximum size of an `INFO` response.
pub const MAX_INFO_RESPONSE_SIZE: usize = 65;
/// Length of a response code (`OKAY`, `FAIL`, `INFO`, `DATA`).
pub const RESPONSE_CODE_LEN: usize = 4;

/// Payload reads larger than this are split into chunks.
pub const USB_CHUNK_SIZE: usize = 1024 * 1024;

// ============================================================================
// Response codes
// ============================================================================

pub const RESPONSE_OKAY: &[u8; 4] = b"OKAY";
pub const RESPONSE_FAIL: &[u8; 4] = b"FAIL";
pub const RESPONSE_INFO: &[u8; 4] = b"INFO";
pub const RESPONSE_DATA: &[u8; 4] = b"DATA";

// ============================================================================
// Transport endpoints
// ============================================================================

/// TCP fallback port.
pub const FASTBOOT_TCP_PORT: u16 = 1234;
/// Dedicated USB function device node.
pub const USB_DEVICE_PATH: &str = "/dev/android_adb";
/// FunctionFS mount point holding `ep0`, `ep1` and `ep2`.
pub const FFS_PATH: &str = "/dev/usb-ffs/adb";
/// Attempts to open FunctionFS `ep0` while it reports EBUSY.
pub const FFS_OPEN_RETRIES: u32 = 30;
/// Delay between `ep0` open attempts.
pub const FFS_OPEN_RETRY_MS: u64 = 100;
/// How often the USB backends are retried while only TCP is listening.
pub const USB_RESCAN_MS: u16 = 1000;

// ============================================================================
// Agent identity
// ============================================================================

/// Value of the `version-bootloader` variable.
pub const BOOTLOADER_VERSION: &str = "2.0";
/// Value of the `kernel` variable.
pub const KERNEL_NAME: &str = "droidboot";
/// Default value of the `product` variable.
pub const DEFAULT_PRODUCT: &str = "droidboot";

// ============================================================================
// Download buffer
// ============================================================================

/// Upper bound of an automatically sized scratch buffer.
pub const MAX_SCRATCH_SIZE: usize = 512 * 1024 * 1024;
/// Spill file for downloads that exceed the scratch capacity.
pub const DOWNLOAD_OVERFLOW_PATH: &str = "/cache/download.tmp";
