//! Exhaustive top-k scan over one collection
//!
//! Every live position is scored in parallel straight from the mapped
//! embedding log. Positions past the snapshot's visible end (written but not
//! yet flushed) are skipped; an id mismatch aborts the whole search with a
//! corruption error.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::Serialize;

use vellum_core::index::CollectionIndex;
use vellum_core::{LogSnapshot, Position, Quantization, QueryVector, ReadError};

/// One search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub content: String,
    pub score: f32,
}

/// Descending by score; ties go to the lower id so results are stable
#[inline]
fn rank(a: &(u64, f32, Position), b: &(u64, f32, Position)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

pub(crate) fn top_k(
    collection: &CollectionIndex,
    snapshot: &LogSnapshot,
    quantization: &Quantization,
    query: &QueryVector,
    k: usize,
) -> Result<Vec<SearchHit>, ReadError> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let element = quantization.element();
    let positions = collection.positions();

    let mut scored = positions
        .par_iter()
        .filter_map(|(id, pos)| match snapshot.vector(*id, pos, element) {
            Ok(Some(stored)) => Some(Ok((*id, quantization.score(query, &stored), *pos))),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, rank);
        scored.truncate(k);
    }
    scored.sort_unstable_by(rank);

    let mut hits = Vec::with_capacity(scored.len());
    for (id, score, pos) in scored {
        if let Some(content) = snapshot.content(id, &pos)? {
            hits.push(SearchHit {
                id,
                content: content.to_owned(),
                score,
            });
        }
    }
    Ok(hits)
}
