//! Shared guardrails for worker counts, page sizes, and stored payload bounds.

// Engine guards
pub const MAX_WORKERS: i64 = 64;
pub const MAX_PAGE_SIZE: i64 = 1000;
pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const DEFAULT_WORKERS: i64 = 4;

// Backoff guards
pub const MAX_BACKOFF_ATTEMPTS: i64 = 10;
pub const MAX_BACKOFF_DELAY_MS: i64 = 60_000;

// Retry guards
pub const DEFAULT_MAX_RETRIES: i64 = 3;

// Validation guards
pub const MAX_SAMPLE_SIZE: i64 = 10_000;
pub const DEFAULT_SAMPLE_SIZE: i64 = 5;

// Ledger guards
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_workers(value: i64) -> usize {
    clamp_int(value, 1, MAX_WORKERS) as usize
}

pub fn clamp_page_size(value: i64) -> usize {
    clamp_int(value, 1, MAX_PAGE_SIZE) as usize
}

pub fn clamp_sample_size(value: i64) -> usize {
    clamp_int(value, 0, MAX_SAMPLE_SIZE) as usize
}

/// Trim and cap an error message before it is written to the ledger.
/// Cuts on a char boundary so multi-byte text never panics.
pub fn truncate_message(message: &str) -> String {
    let stripped = message.trim();
    if stripped.len() <= MAX_ERROR_MESSAGE_LEN {
        return stripped.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !stripped.is_char_boundary(end) {
        end -= 1;
    }
    stripped[..end].to_string()
}
