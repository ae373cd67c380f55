//! Distributed octree operations.
//!
//! Everything in this module requires the `mpi` feature. The octree is
//! distributed by contiguous Morton ranges; the collective operations
//! here rebalance those ranges by weight, exchange the partition bounds
//! and rebuild the ghost layer. All collectives are bulk-synchronous and
//! involve every rank of the communicator.
//!
//! Octant payloads travel as plain `u64`/`i8`/`u8` buffers so no custom
//! MPI datatypes are needed.

use itertools::Itertools;
use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::traits::{CommunicatorCollectives, Equivalence, Root};
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::morton::MortonKey;
use crate::octree::{GhostOctant, Octant, Octree};

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`; the last
/// count only contributes to the total.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Gather an array to all processes.
pub fn gather_to_all<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Vec<T> {
    let size = comm.size() as usize;

    let local_len = arr.len() as i32;
    let mut counts = vec![0i32; size];
    comm.all_gather_into(&local_len, &mut counts);

    let total = counts.iter().sum::<i32>() as usize;
    let mut recvbuffer = vec![T::default(); total];

    let displs = displacements(&counts);
    let mut partition = PartitionMut::new(&mut recvbuffer[..], counts, &displs[..]);
    comm.all_gather_varcount_into(arr, &mut partition);

    recvbuffer
}

/// Redistribute an array via an all-to-all, sending `counts[r]` local
/// elements to rank `r`.
pub fn redistribute<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> Vec<T> {
    let size = comm.size() as usize;
    debug_assert_eq!(counts.len(), size);

    let mut counts_from = vec![0i32; size];
    comm.all_to_all_into(counts, &mut counts_from);

    let send_displs = displacements(counts);
    let send_partition = Partition::new(arr, counts, &send_displs[..]);

    let total = counts_from.iter().sum::<i32>() as usize;
    let mut recvbuffer = vec![T::default(); total];
    let recv_displs = displacements(&counts_from);
    let mut recv_partition =
        PartitionMut::new(&mut recvbuffer[..], counts_from, &recv_displs[..]);

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    recvbuffer
}

/// Global inclusive cumulative sum of the local weights: the returned
/// array contains, for each local element, the sum of every element on
/// lower ranks plus the local prefix.
pub fn global_inclusive_cumsum<C: CommunicatorCollectives>(weights: &[f64], comm: &C) -> Vec<f64> {
    let mut scan: Vec<f64> = weights
        .iter()
        .scan(0.0, |state, &w| {
            *state += w;
            Some(*state)
        })
        .collect_vec();

    let local_total = scan.last().copied().unwrap_or(0.0);
    let mut offset = 0.0;
    comm.exclusive_scan_into(&local_total, &mut offset, SystemOperation::sum());
    if comm.rank() > 0 {
        for value in &mut scan {
            *value += offset;
        }
    }

    scan
}

impl Octree {
    /// Reshuffle octants so every rank holds a contiguous Morton range
    /// whose weight sum approximates `total / n_ranks`. Weights default
    /// to one per octant. The transfer is recorded in
    /// [`Octree::sent_ranges`] and the mapping table, and the ghost
    /// layer and partition bounds are rebuilt.
    pub fn load_balance<C: CommunicatorCollectives>(
        &mut self,
        weights: Option<&[f64]>,
        comm: &C,
    ) -> Result<()> {
        let size = comm.size() as usize;
        let rank = comm.rank() as usize;
        self.rank = rank;
        self.n_ranks = size;

        let n_local = self.octants.len();
        if let Some(weights) = weights {
            if weights.len() != n_local {
                return Err(MeshError::PartitionError(format!(
                    "got {} weights for {} octants",
                    weights.len(),
                    n_local
                )));
            }
        }

        if size == 1 {
            self.sent_ranges.clear();
            self.build_identity_mapping();
            return Ok(());
        }

        let old_partition = self.partition_first_keys.clone();

        let weights: Vec<f64> = match weights {
            Some(w) => w.to_vec(),
            None => vec![1.0; n_local],
        };

        // Scan the weights globally and broadcast the total from the
        // last rank.
        let scan = global_inclusive_cumsum(&weights, comm);
        let mut total_weight = if rank == size - 1 {
            scan.last().copied().unwrap_or(0.0)
        } else {
            0.0
        };
        comm.process_at_rank(size as i32 - 1)
            .broadcast_into(&mut total_weight);
        if !(total_weight > 0.0) {
            return Err(MeshError::PartitionError(
                "total octant weight must be positive".to_string(),
            ));
        }

        // Destination of each local octant. The scan is monotone, so the
        // destinations are non-decreasing and each rank receives one
        // contiguous slice of the local range.
        let target = total_weight / size as f64;
        let destination = |cumulative: f64| -> usize {
            ((cumulative / target).ceil() as usize).clamp(1, size) - 1
        };

        let mut counts = vec![0i32; size];
        for &cumulative in &scan {
            counts[destination(cumulative)] += 1;
        }

        // Record the shipped index ranges per destination before the
        // exchange; the local range can be split at both ends, giving at
        // most one range towards lower and one towards higher ranks.
        self.sent_ranges.clear();
        let mut begin = 0u32;
        for (dest, &count) in counts.iter().enumerate() {
            let end = begin + count as u32;
            if dest != rank && count > 0 {
                self.sent_ranges.insert(dest, [begin, end, 0, 0]);
            }
            begin = end;
        }

        debug!(
            rank,
            sent = self.sent_ranges.len(),
            "load balance ships octant ranges"
        );

        // Ship the octant payload.
        let key_values: Vec<u64> = self.octants.iter().map(|o| o.key().value()).collect();
        let markers: Vec<i8> = self.octants.iter().map(|o| o.marker()).collect();
        let balance_flags: Vec<u8> = self.octants.iter().map(|o| o.balance() as u8).collect();

        let new_keys = redistribute(&key_values, &counts, comm);
        let new_markers = redistribute(&markers, &counts, comm);
        let new_balance = redistribute(&balance_flags, &counts, comm);

        // Incoming slices arrive rank by rank and each is Morton sorted,
        // and ranges from different ranks do not interleave, so the
        // concatenation is already sorted.
        debug_assert!(new_keys.windows(2).all(|w| w[0] < w[1]));

        self.octants = new_keys
            .iter()
            .zip(new_markers)
            .zip(new_balance)
            .map(|((&value, marker), balance)| Octant {
                key: MortonKey::new(value),
                marker,
                balance: balance != 0,
            })
            .collect();

        // Mapping: octants that stayed local map to their previous local
        // index; received octants carry only the source rank.
        let mut mapping = super::AdaptMapping::default();
        for octant in &self.octants {
            let source = partition_owner(&old_partition, octant.key);
            if source == rank {
                // The old local array was contiguous in Morton order;
                // recover the previous index by binary search.
                let old_idx = key_values
                    .binary_search(&octant.key.value())
                    .expect("kept octant was local") as u32;
                mapping.octant_map.push(vec![old_idx]);
                mapping.ghost_flags.push(vec![false]);
                mapping.octant_ranks.push(vec![rank]);
            } else {
                mapping.octant_map.push(Vec::new());
                mapping.ghost_flags.push(Vec::new());
                mapping.octant_ranks.push(vec![source]);
            }
            mapping.new_refined.push(false);
            mapping.new_coarsened.push(false);
        }
        self.mapping = Some(mapping);

        // Refresh the global prefix of the local range.
        let local_count = self.octants.len() as u64;
        let mut offset = 0u64;
        comm.exclusive_scan_into(&local_count, &mut offset, SystemOperation::sum());
        self.global_offset = if rank == 0 { 0 } else { offset };

        self.exchange_partition_bounds(comm)?;
        self.build_ghost_layer(comm);

        Ok(())
    }

    // Identity mapping used when a collective turns out to be a local
    // no-op; the patch sync still expects a mapping table.
    fn build_identity_mapping(&mut self) {
        let rank = self.rank;
        let mut mapping = super::AdaptMapping::default();
        for idx in 0..self.octants.len() as u32 {
            mapping.octant_map.push(vec![idx]);
            mapping.ghost_flags.push(vec![false]);
            mapping.octant_ranks.push(vec![rank]);
            mapping.new_refined.push(false);
            mapping.new_coarsened.push(false);
        }
        self.mapping = Some(mapping);
    }

    // Gather the first local key of every rank. Ranks must hold at least
    // one octant after a load balance, which the weighted binning
    // guarantees for positive totals.
    fn exchange_partition_bounds<C: CommunicatorCollectives>(&mut self, comm: &C) -> Result<()> {
        let first = self
            .octants
            .first()
            .map(|octant| octant.key().value())
            .ok_or_else(|| {
                MeshError::PartitionError("rank ended up with an empty octant range".to_string())
            })?;

        let firsts = gather_to_all(std::slice::from_ref(&first), comm);
        self.partition_first_keys = firsts.into_iter().map(MortonKey::new).collect();
        Ok(())
    }

    /// Rebuild the ghost layer: every rank sends the octants adjacent to
    /// foreign Morton ranges to the ranks that see them, and stores the
    /// octants received in return as its ghosts.
    pub fn build_ghost_layer<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let size = comm.size() as usize;
        let rank = comm.rank() as usize;

        // Collect, per foreign rank, the local boundary octants it needs.
        let mut send_keys: Vec<Vec<u64>> = vec![Vec::new(); size];
        for octant in &self.octants {
            let key = octant.key();
            let mut targets = Vec::new();

            let mut codims = vec![1, self.dim];
            if self.dim == 3 {
                codims.push(2);
            }
            for codim in codims {
                for entity in 0..self.entity_count(codim) {
                    let direction = self.entity_direction(entity, codim);
                    let Some(neighbour) = key.neighbour(direction, self.dim) else {
                        continue;
                    };
                    // Every rank whose range overlaps the neighbour
                    // region may hold adjacent leaves.
                    let first = partition_owner(&self.partition_first_keys, neighbour);
                    let last = partition_owner(
                        &self.partition_first_keys,
                        MortonKey::new(neighbour.descendant_upper_bound(self.dim)),
                    );
                    for target in first..=last {
                        if target != rank && !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
            }

            for target in targets {
                send_keys[target].push(key.value());
            }
        }

        let mut flat_keys = Vec::new();
        let mut counts = vec![0i32; size];
        for (target, keys) in send_keys.into_iter().enumerate() {
            counts[target] = keys.len() as i32;
            flat_keys.extend(keys);
        }

        let received = redistribute(&flat_keys, &counts, comm);

        let mut ghosts: Vec<GhostOctant> = received
            .into_iter()
            .map(MortonKey::new)
            .map(|key| GhostOctant {
                key,
                rank: partition_owner(&self.partition_first_keys, key),
            })
            .collect();
        ghosts.sort_unstable_by_key(|ghost| ghost.key.value());
        ghosts.dedup_by_key(|ghost| ghost.key.value());
        self.ghosts = ghosts;

        debug!(rank, ghosts = self.ghosts.len(), "ghost layer rebuilt");
    }

}

// The rank owning a key under the given partition bounds.
fn partition_owner(partition_first_keys: &[MortonKey], key: MortonKey) -> usize {
    let position = partition_first_keys.partition_point(|first| first.value() <= key.value());
    position.saturating_sub(1)
}
