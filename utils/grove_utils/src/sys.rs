// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs;

/// CPU architecture of this machine, as advertised in the capability tags.
pub fn machine_arch() -> String {
    std::env::consts::ARCH.to_string()
}

/// Logical CPU count.
pub fn machine_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Total memory in mebibytes, best effort. Returns 0 where the platform
/// offers no cheap answer.
pub fn machine_ram_mb() -> u64 {
    if let Ok(meminfo) = fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
                return kb / 1024;
            }
        }
    }
    0
}

/// Short hostname used as the default member name.
pub fn machine_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "grove-node".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_return_sane_values() {
        assert!(!machine_arch().is_empty());
        assert!(machine_cpus() >= 1);
        assert!(!machine_hostname().is_empty());
    }
}
