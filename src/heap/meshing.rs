use super::miniheap::{MiniHeapId, MiniHeapTable};
use super::rng::Mt64;

/// Randomized greedy pairing: shuffle the candidate heaps, split them into
/// two groups, and walk the left group pairing each heap with the first
/// right-group heap whose occupancy bitmap is disjoint. Each heap is used
/// at most once per pass.
///
/// Pairs are offered to `found`; the caller re-checks candidacy before
/// queueing (a heap may have been reattached since the candidate list was
/// built).
pub(crate) fn simple_greedy_splitting(
    prng: &mut Mt64,
    mut candidates: Vec<MiniHeapId>,
    table: &MiniHeapTable,
    mut found: impl FnMut(MiniHeapId, MiniHeapId),
) {
    if candidates.len() < 2 {
        return;
    }
    prng.shuffle(&mut candidates);
    let (left, right) = candidates.split_at(candidates.len() / 2);

    let mut taken = vec![false; right.len()];
    for &l in left {
        let Some(l_mh) = table.get(l) else { continue };
        for (i, &r) in right.iter().enumerate() {
            if taken[i] {
                continue;
            }
            let Some(r_mh) = table.get(r) else { continue };
            if l_mh.bitmap().is_disjoint(r_mh.bitmap()) {
                taken[i] = true;
                found(l, r);
                break;
            }
        }
    }
}
