//! Shard-to-CPU affinity planning and application.
//!
//! Logical processors are modeled as groups of up to 64 (the native mask
//! width): `group = cpu / 64`, local index within the group's mask. The
//! planner maps shard indices onto `(group, mask)` entries under a policy;
//! application happens in two places with the same entry: the shard's socket
//! (`SO_INCOMING_CPU`) and its worker threads (`sched_setaffinity`).

use std::io;

use socket2::Socket;

/// Native mask width of one processor group.
pub const GROUP_MASK_WIDTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityPolicy {
    #[default]
    None,
    /// Round-robin shards over all logical processors, one CPU per shard.
    PerCpu,
    /// Round-robin shards over groups, the full group mask per shard.
    PerGroup,
    /// Treated identically to `PerCpu` for shard mapping.
    RssAligned,
    /// The caller supplies the mapping.
    Manual,
}

/// One shard's binding: a processor group and a CPU mask within it.
/// An empty mask means "no binding".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAffinity {
    pub group: u16,
    pub mask: u64,
}

impl GroupAffinity {
    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Lowest set bit of the mask: the CPU index within the group.
    pub fn local_index(&self) -> Option<u32> {
        if self.mask == 0 {
            None
        } else {
            Some(self.mask.trailing_zeros())
        }
    }

    /// CPU index across all groups.
    pub fn global_cpu_index(&self) -> Option<u32> {
        self.local_index()
            .map(|local| u32::from(self.group) * GROUP_MASK_WIDTH + local)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuAffinityInfo {
    pub processor_group_count: u32,
    pub logical_processor_count: u32,
    /// Whether the kernel accepts the per-socket CPU-affinity option.
    pub supports_socket_affinity: bool,
}

/// Probe processor topology and per-socket affinity support once at startup.
pub fn query_cpu_affinity_support() -> CpuAffinityInfo {
    let logical = logical_processor_count();
    CpuAffinityInfo {
        processor_group_count: logical.div_ceil(GROUP_MASK_WIDTH),
        logical_processor_count: logical,
        supports_socket_affinity: probe_socket_affinity(),
    }
}

fn logical_processor_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn probe_socket_affinity() -> bool {
    use socket2::{Domain, Type};

    let Ok(socket) = Socket::new(Domain::IPV4, Type::DGRAM, None) else {
        return false;
    };
    socket.set_cpu_affinity(0).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn probe_socket_affinity() -> bool {
    false
}

fn processor_counts_per_group(total: u32) -> Vec<u32> {
    let groups = total.div_ceil(GROUP_MASK_WIDTH).max(1);
    (0..groups)
        .map(|g| {
            let before = g * GROUP_MASK_WIDTH;
            (total - before).min(GROUP_MASK_WIDTH)
        })
        .collect()
}

/// Convert a global CPU index to (group, local index) by prefix-summing the
/// per-group counts.
fn global_index_to_group(global: u32, per_group: &[u32]) -> (u16, u32) {
    let mut accumulated = 0;
    for (group, count) in per_group.iter().enumerate() {
        if global < accumulated + count {
            return (group as u16, global - accumulated);
        }
        accumulated += count;
    }
    // fall back to the last group's last CPU
    let last = per_group.len().saturating_sub(1);
    (last as u16, per_group.get(last).map_or(0, |c| c - 1))
}

/// Map `shard_count` shards to `(group, mask)` entries under `policy`.
///
/// Returns `None` ("absent") when `shard_count` is zero or the policy is
/// `Manual` (external mapping required).
pub fn compute_shard_affinities(
    shard_count: u32,
    policy: AffinityPolicy,
) -> Option<Vec<GroupAffinity>> {
    if shard_count == 0 {
        return None;
    }

    let per_group = processor_counts_per_group(logical_processor_count());
    let total: u32 = per_group.iter().sum();
    if total == 0 {
        return None;
    }

    match policy {
        AffinityPolicy::None => Some(vec![GroupAffinity { group: 0, mask: 0 }; shard_count as usize]),

        AffinityPolicy::Manual => None,

        AffinityPolicy::PerCpu | AffinityPolicy::RssAligned => Some(
            (0..shard_count)
                .map(|i| {
                    let (group, local) = global_index_to_group(i % total, &per_group);
                    GroupAffinity {
                        group,
                        mask: 1u64 << local,
                    }
                })
                .collect(),
        ),

        AffinityPolicy::PerGroup => {
            let group_masks: Vec<u64> = per_group
                .iter()
                .map(|&count| {
                    if count >= GROUP_MASK_WIDTH {
                        u64::MAX
                    } else {
                        (1u64 << count) - 1
                    }
                })
                .collect();

            Some(
                (0..shard_count)
                    .map(|i| {
                        let group = (i as usize) % group_masks.len();
                        GroupAffinity {
                            group: group as u16,
                            mask: group_masks[group],
                        }
                    })
                    .collect(),
            )
        }
    }
}

/// Steer the socket's receive processing to the entry's CPU. No-op for an
/// empty mask.
pub fn apply_socket_affinity(socket: &Socket, entry: &GroupAffinity) -> io::Result<()> {
    let Some(cpu) = entry.global_cpu_index() else {
        return Ok(());
    };

    #[cfg(target_os = "linux")]
    {
        socket.set_cpu_affinity(cpu as usize)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, cpu);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "per-socket CPU affinity is not supported on this platform",
        ))
    }
}

/// Pin the calling thread to the entry's CPUs. No-op for an empty mask.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(entry: &GroupAffinity) -> io::Result<()> {
    if entry.is_empty() {
        return Ok(());
    }

    // SAFETY: cpu_set_t is a plain bitmask struct; zero-initialization is valid.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let base = u32::from(entry.group) * GROUP_MASK_WIDTH;
    for bit in 0..GROUP_MASK_WIDTH {
        if entry.mask & (1u64 << bit) != 0 {
            // SAFETY: CPU_SET writes within the zeroed set for indices below
            // CPU_SETSIZE; group * 64 + bit stays far below it.
            unsafe { libc::CPU_SET((base + bit) as usize, &mut set) };
        }
    }

    // SAFETY: pid 0 targets the calling thread; the set outlives the call.
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_entry: &GroupAffinity) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_reports_topology() {
        let info = query_cpu_affinity_support();
        assert!(info.processor_group_count >= 1);
        assert!(info.logical_processor_count >= 1);
    }

    #[test]
    fn zero_shards_or_manual_is_absent() {
        assert!(compute_shard_affinities(0, AffinityPolicy::PerCpu).is_none());
        assert!(compute_shard_affinities(4, AffinityPolicy::Manual).is_none());
    }

    #[test]
    fn none_policy_yields_empty_masks() {
        let entries = compute_shard_affinities(4, AffinityPolicy::None).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(GroupAffinity::is_empty));
    }

    #[test]
    fn per_cpu_yields_single_bit_masks() {
        for policy in [AffinityPolicy::PerCpu, AffinityPolicy::RssAligned] {
            let entries = compute_shard_affinities(8, policy).unwrap();
            assert_eq!(entries.len(), 8);
            for entry in &entries {
                assert_eq!(entry.mask.count_ones(), 1);
            }
        }
    }

    #[test]
    fn per_cpu_union_covers_all_processors() {
        let total = query_cpu_affinity_support().logical_processor_count;
        // at least one shard per CPU guarantees full coverage; groups are
        // dense (64 CPUs each except the last) so the global index is dense
        let entries = compute_shard_affinities(total * 2, AffinityPolicy::PerCpu).unwrap();

        let mut covered = vec![false; total as usize];
        for entry in &entries {
            let cpu = entry.global_cpu_index().unwrap();
            covered[cpu as usize] = true;
        }
        assert!(covered.into_iter().all(|c| c));
    }

    #[test]
    fn single_shard_per_cpu_lands_in_group_zero() {
        let entries = compute_shard_affinities(1, AffinityPolicy::PerCpu).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group, 0);
        assert_eq!(entries[0].mask.count_ones(), 1);
    }

    #[test]
    fn per_group_yields_full_group_masks() {
        let entries = compute_shard_affinities(3, AffinityPolicy::PerGroup).unwrap();
        assert_eq!(entries.len(), 3);

        let per_group = processor_counts_per_group(logical_processor_count());
        for entry in &entries {
            let count = per_group[entry.group as usize];
            let expected = if count >= GROUP_MASK_WIDTH {
                u64::MAX
            } else {
                (1u64 << count) - 1
            };
            assert_eq!(entry.mask, expected);
            assert!(!entry.is_empty());
        }
    }

    #[test]
    fn group_mapping_prefix_sums() {
        let per_group = [64, 64, 8];
        assert_eq!(global_index_to_group(0, &per_group), (0, 0));
        assert_eq!(global_index_to_group(63, &per_group), (0, 63));
        assert_eq!(global_index_to_group(64, &per_group), (1, 0));
        assert_eq!(global_index_to_group(130, &per_group), (2, 2));
    }

    #[test]
    fn global_cpu_index_combines_group_and_bit() {
        let entry = GroupAffinity {
            group: 1,
            mask: 1 << 3,
        };
        assert_eq!(entry.local_index(), Some(3));
        assert_eq!(entry.global_cpu_index(), Some(67));

        let empty = GroupAffinity { group: 0, mask: 0 };
        assert_eq!(empty.local_index(), None);
        assert_eq!(empty.global_cpu_index(), None);
    }
}
