//! The host-call bridge: maps `(module, name)` import pairs to native
//! entry points.
//!
//! Host functions receive a single argument, the base of the guest
//! callee's frame; guest arguments are read from `[base + 8]`,
//! `[base + 16]`, ... in push order. Integer results return in `rax`.
//! Guest pointers arrive as 32-bit offsets and are resolved against the
//! GS base by the host side.

use crate::wasi;
use codegen::ImportResolver;
use compact_str::CompactString;
use hashbrown::HashMap;

type HostFn = extern "C" fn(usize) -> u32;

pub struct HostTable {
    map: HashMap<(CompactString, CompactString), u64>,
}

impl HostTable {
    /// The WASI snapshot-preview1 surface.
    pub fn wasi() -> HostTable {
        let mut table = HostTable {
            map: HashMap::new(),
        };
        const NS: &str = "wasi_snapshot_preview1";
        table.insert(NS, "fd_prestat_get", wasi::fd_prestat_get);
        table.insert(NS, "fd_prestat_dir_name", wasi::fd_prestat_dir_name);
        table.insert(NS, "environ_sizes_get", wasi::environ_sizes_get);
        table.insert(NS, "environ_get", wasi::environ_get);
        table.insert(NS, "args_sizes_get", wasi::args_sizes_get);
        table.insert(NS, "args_get", wasi::args_get);
        table.insert(NS, "clock_time_get", wasi::clock_time_get);
        table.insert(NS, "fd_fdstat_get", wasi::fd_fdstat_get);
        table.insert(NS, "fd_close", wasi::fd_close);
        table.insert(NS, "fd_seek", wasi::fd_seek);
        table.insert(NS, "fd_write", wasi::fd_write);
        table.insert(NS, "poll_oneoff", wasi::poll_oneoff);
        table.insert(NS, "random_get", wasi::random_get);
        // proc_exit never returns; the signature differs.
        table
            .map
            .insert((NS.into(), "proc_exit".into()), wasi::proc_exit as usize as u64);
        table
    }

    fn insert(&mut self, module: &str, name: &str, f: HostFn) {
        self.map
            .insert((module.into(), name.into()), f as usize as u64);
    }
}

impl ImportResolver for HostTable {
    fn resolve(&self, module: &str, name: &str) -> Option<u64> {
        self.map
            .get(&(CompactString::from(module), CompactString::from(name)))
            .copied()
    }

    fn memory_grow_entry(&self) -> u64 {
        crate::memory::grow_memory_entry as usize as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_wasi_names() {
        let table = HostTable::wasi();
        assert!(table
            .resolve("wasi_snapshot_preview1", "fd_write")
            .is_some());
        assert!(table
            .resolve("wasi_snapshot_preview1", "proc_exit")
            .is_some());
        assert!(table.resolve("wasi_snapshot_preview1", "sock_recv").is_none());
        assert!(table.resolve("env", "fd_write").is_none());
        assert_ne!(table.memory_grow_entry(), 0);
    }
}
