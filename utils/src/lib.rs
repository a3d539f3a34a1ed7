//! Small helpers shared by the workspace crates to report sizes and memory usage in logs.

use bytesize::ByteSize;
use thousands::Separable;
use tracing::debug;

/// Formats a byte count in human readable form, e.g. `12.3 MiB`.
pub fn human_bytes(bytes: usize) -> String {
    ByteSize::b(bytes as u64).to_string()
}

/// Formats a count with thousands separators, e.g. `1,234,567`.
pub fn separated(count: usize) -> String {
    count.separate_with_commas()
}

/// Physical memory currently used by the process, if the platform exposes it.
pub fn physical_memory() -> Option<usize> {
    memory_stats::memory_stats().map(|stats| stats.physical_mem)
}

/// Emits a debug event with the current physical memory usage of the process.
pub fn log_memory(label: &str) {
    match physical_memory() {
        Some(bytes) => debug!("{label}: physical memory {}", human_bytes(bytes)),
        None => debug!("{label}: memory statistics unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separated() {
        assert_eq!(separated(0), "0");
        assert_eq!(separated(1234567), "1,234,567");
    }

    #[test]
    fn test_human_bytes() {
        assert!(human_bytes(0).starts_with('0'));
        assert!(human_bytes(3 * 1024 * 1024).starts_with('3'));
    }
}
