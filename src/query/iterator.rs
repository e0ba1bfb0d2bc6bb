//! Pull-based point iterators and the time-ordered merge.

use super::types::{IteratorStats, Point};
use crate::Result;
use async_trait::async_trait;
use std::cmp::Ordering;

/// A source of points, local or remote.
#[async_trait]
pub trait PointIterator: Send {
    /// Next point, or `None` when exhausted.
    async fn next_point(&mut self) -> Result<Option<Point>>;

    /// Release the underlying resources. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;

    fn stats(&self) -> IteratorStats;
}

pub type BoxIterator = Box<dyn PointIterator>;

/// Iterator over an in-memory, already ordered set of points.
pub struct VecIterator {
    points: std::vec::IntoIter<Point>,
    stats: IteratorStats,
}

impl VecIterator {
    pub fn new(points: Vec<Point>, stats: IteratorStats) -> Self {
        Self {
            points: points.into_iter(),
            stats,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), IteratorStats::default())
    }
}

#[async_trait]
impl PointIterator for VecIterator {
    async fn next_point(&mut self) -> Result<Option<Point>> {
        Ok(self.points.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.points = Vec::new().into_iter();
        Ok(())
    }

    fn stats(&self) -> IteratorStats {
        self.stats
    }
}

/// Merges inputs that are each ordered by time into one ordered stream.
/// Ties break on series key so output is deterministic.
pub struct MergeIterator {
    inputs: Vec<BoxIterator>,
    heads: Vec<Option<Point>>,
    primed: bool,
    ascending: bool,
}

impl MergeIterator {
    pub fn new(inputs: Vec<BoxIterator>, ascending: bool) -> Self {
        let heads = inputs.iter().map(|_| None).collect();
        Self {
            inputs,
            heads,
            primed: false,
            ascending,
        }
    }

    async fn prime(&mut self) -> Result<()> {
        for (i, input) in self.inputs.iter_mut().enumerate() {
            self.heads[i] = input.next_point().await?;
        }
        self.primed = true;
        Ok(())
    }

    fn compare(&self, a: &Point, b: &Point) -> Ordering {
        let by_time = if self.ascending {
            a.time.cmp(&b.time)
        } else {
            b.time.cmp(&a.time)
        };
        by_time.then_with(|| a.series_key().cmp(&b.series_key()))
    }
}

#[async_trait]
impl PointIterator for MergeIterator {
    async fn next_point(&mut self) -> Result<Option<Point>> {
        if !self.primed {
            self.prime().await?;
        }

        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(candidate) = head else { continue };
            best = match best {
                Some(b) => match &self.heads[b] {
                    Some(current) if self.compare(candidate, current) == Ordering::Less => Some(i),
                    _ => Some(b),
                },
                None => Some(i),
            };
        }

        let Some(i) = best else { return Ok(None) };
        let point = self.heads[i].take();
        self.heads[i] = self.inputs[i].next_point().await?;
        Ok(point)
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for input in self.inputs.iter_mut() {
            if let Err(e) = input.close().await {
                first_err.get_or_insert(e);
            }
        }
        self.heads.iter_mut().for_each(|h| *h = None);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stats(&self) -> IteratorStats {
        let mut stats = IteratorStats::default();
        for input in &self.inputs {
            stats.add(input.stats());
        }
        stats
    }
}

/// Merge a set of iterators into one ordered iterator.
pub fn merge(inputs: Vec<BoxIterator>, ascending: bool) -> BoxIterator {
    Box::new(MergeIterator::new(inputs, ascending))
}

/// Close every iterator, ignoring failures. Used when unwinding a partial fan-out.
pub async fn close_all(iterators: &mut [BoxIterator]) {
    for itr in iterators.iter_mut() {
        let _ = itr.close().await;
    }
}

/// Drain an iterator into a vector and close it.
pub async fn collect_points(mut itr: BoxIterator) -> Result<Vec<Point>> {
    let mut out = Vec::new();
    while let Some(p) = itr.next_point().await? {
        out.push(p);
    }
    itr.close().await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(times: &[i64]) -> BoxIterator {
        let pts = times.iter().map(|t| Point::new("cpu", *t)).collect();
        Box::new(VecIterator::new(pts, IteratorStats::default()))
    }

    #[tokio::test]
    async fn merge_orders_by_time() {
        let merged = merge(vec![points(&[1, 4, 9]), points(&[2, 3]), points(&[])], true);
        let times: Vec<i64> = collect_points(merged)
            .await
            .unwrap()
            .iter()
            .map(|p| p.time)
            .collect();
        assert_eq!(times, vec![1, 2, 3, 4, 9]);
    }

    #[tokio::test]
    async fn merge_descending() {
        let merged = merge(vec![points(&[9, 4, 1]), points(&[3, 2])], false);
        let times: Vec<i64> = collect_points(merged)
            .await
            .unwrap()
            .iter()
            .map(|p| p.time)
            .collect();
        assert_eq!(times, vec![9, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn merge_sums_stats() {
        let a = VecIterator::new(vec![], IteratorStats { series_n: 1, point_n: 3 });
        let b = VecIterator::new(vec![], IteratorStats { series_n: 2, point_n: 5 });
        let merged = merge(vec![Box::new(a), Box::new(b)], true);
        assert_eq!(merged.stats(), IteratorStats { series_n: 3, point_n: 8 });
    }
}
