//! # quorum
//!
//! why: keep the majority arithmetic in one pure, testable place
//! relations: used by raft-node for vote counting and commit advancement
//! what: quorum threshold and the replicated-index median

use crate::node::LogIndex;

/// Largest count that is still a minority of `voters`.
///
/// A candidate wins once its votes exceed this value.
pub fn quorum(voters: usize) -> usize {
    voters / 2
}

/// True when `votes` out of `voters` form a majority
pub fn is_majority(votes: usize, voters: usize) -> bool {
    votes > quorum(voters)
}

/// Highest index stored on a majority of `match_indices`.
///
/// For an even count the lower of the two middle values is taken, so the
/// result is always replicated on more than half of the voters.
pub fn median_low(match_indices: &[LogIndex]) -> LogIndex {
    if match_indices.is_empty() {
        return 0;
    }
    let mut sorted = match_indices.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 0 {
        sorted[n / 2 - 1]
    } else {
        sorted[n / 2]
    }
}
