//! Quorum size calculations for a fixed-size voter set.

/// The number of votes needed for a majority of `cluster_size` voters.
pub fn majority_of(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
