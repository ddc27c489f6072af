//! # Cluster Entry Iterator
//!
//! Position-ordered walk over every live record of a cluster. Positions are
//! fetched in bucket-sized batches through `ceiling_positions`, so the
//! iterator never materializes the whole position space; records deleted
//! between batches are simply skipped.

use eyre::Result;

use super::{PaginatedCluster, PhysicalPosition};

pub struct ClusterEntryIterator<'a> {
    cluster: &'a PaginatedCluster,
    batch: std::vec::IntoIter<i64>,
    next_from: i64,
    exhausted: bool,
}

impl<'a> ClusterEntryIterator<'a> {
    pub(crate) fn new(cluster: &'a PaginatedCluster) -> Self {
        Self {
            cluster,
            batch: Vec::new().into_iter(),
            next_from: 0,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<bool> {
        let positions = self.cluster.ceiling_positions(self.next_from)?;
        match positions.last() {
            Some(&last) => {
                self.next_from = last + 1;
                self.batch = positions.into_iter();
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }
}

impl Iterator for ClusterEntryIterator<'_> {
    type Item = Result<PhysicalPosition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(position) = self.batch.next() {
                match self.cluster.get_physical_position(position) {
                    Ok(Some(physical)) => return Some(Ok(physical)),
                    // deleted or hidden since the batch was fetched
                    Ok(None) => continue,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                }
            }

            if self.exhausted {
                return None;
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
