//! Default constants for unicontact configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";

/// Default per-request budget in milliseconds.
/// A reconciliation that has not committed by then is abandoned without writing.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// How many times a reconciliation re-reads and re-plans after a commit conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Run RocksDB repair before opening
pub const DEFAULT_REPAIR_ON_OPEN: bool = false;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "UNICONTACT_";
