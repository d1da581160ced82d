//! Block-index list: which block heights are relevant to a Value and who
//! owned it at each ownership change.

use serde::{Deserialize, Serialize};

/// One ownership change: the Value was owned by `address` starting at `height`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    /// Block height at which this ownership began.
    pub height: u64,
    /// Owning address, as `0x`-prefixed hex.
    pub address: String,
}

/// Strictly-increasing block heights plus ordered ownership-change history
/// for one Value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexList {
    heights: Vec<u64>,
    owners: Vec<OwnerRecord>,
}

impl BlockIndexList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from raw parts, validating that `heights` is strictly
    /// increasing, `owners` is sorted by strictly increasing height, and
    /// every owner height is present in `heights`.
    #[must_use]
    pub fn from_parts(heights: Vec<u64>, owners: Vec<OwnerRecord>) -> Option<Self> {
        let list = Self { heights, owners };
        list.check().then_some(list)
    }

    /// All relevant heights, strictly increasing.
    #[must_use]
    pub fn heights(&self) -> &[u64] {
        &self.heights
    }

    /// All ownership changes, sorted by height.
    #[must_use]
    pub fn owners(&self) -> &[OwnerRecord] {
        &self.owners
    }

    /// The last (highest) relevant height, if any.
    #[must_use]
    pub fn last_height(&self) -> Option<u64> {
        self.heights.last().copied()
    }

    /// Idempotently inserts `height`, preserving sort order.
    pub fn append_height(&mut self, height: u64) {
        if let Err(idx) = self.heights.binary_search(&height) {
            self.heights.insert(idx, height);
        }
    }

    /// Records an ownership change at `height`, inserting `height` into
    /// `heights` if it is not already present.
    pub fn record_ownership_change(&mut self, height: u64, address: &str) {
        self.append_height(height);
        match self.owners.binary_search_by_key(&height, |o| o.height) {
            Ok(idx) => self.owners[idx].address = address.to_owned(),
            Err(idx) => self.owners.insert(
                idx,
                OwnerRecord {
                    height,
                    address: address.to_owned(),
                },
            ),
        }
    }

    /// The owner in effect at `height`: the latest owner record at or before
    /// `height`, or `None` if `height` precedes the first ownership record.
    #[must_use]
    pub fn owner_at(&self, height: u64) -> Option<&str> {
        self.owners
            .iter()
            .rev()
            .find(|o| o.height <= height)
            .map(|o| o.address.as_str())
    }

    /// Merges `other` into `self`: union of heights, union of owner records
    /// preferring `other`'s record when both define the same height. Callers
    /// pass the more-recently-updated list as `other`.
    pub fn merge(&mut self, other: &BlockIndexList) {
        for &h in &other.heights {
            self.append_height(h);
        }
        for record in &other.owners {
            self.record_ownership_change(record.height, &record.address);
        }
    }

    /// Validates the list's structural invariants.
    #[must_use]
    pub fn check(&self) -> bool {
        let heights_sorted = self.heights.windows(2).all(|w| w[0] < w[1]);
        let owners_sorted = self.owners.windows(2).all(|w| w[0].height < w[1].height);
        let owners_in_heights = self
            .owners
            .iter()
            .all(|o| self.heights.binary_search(&o.height).is_ok());
        let first_height_has_owner = match (self.heights.first(), self.owners.first()) {
            (Some(&first_height), Some(first_owner)) => first_height >= first_owner.height,
            _ => true,
        };
        heights_sorted && owners_sorted && owners_in_heights && first_height_has_owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_height_is_idempotent_and_sorted() {
        let mut list = BlockIndexList::new();
        list.append_height(10);
        list.append_height(5);
        list.append_height(10);
        assert_eq!(list.heights(), &[5, 10]);
    }

    #[test]
    fn record_ownership_change_inserts_height() {
        let mut list = BlockIndexList::new();
        list.record_ownership_change(8, "0xalice");
        assert_eq!(list.heights(), &[8]);
        assert_eq!(list.owner_at(100), Some("0xalice"));
        assert_eq!(list.owner_at(7), None);
    }

    #[test]
    fn owner_at_tracks_latest_change() {
        let mut list = BlockIndexList::new();
        list.record_ownership_change(0, "0xalice");
        list.record_ownership_change(15, "0xbob");
        list.record_ownership_change(27, "0xcharlie");
        assert_eq!(list.owner_at(0), Some("0xalice"));
        assert_eq!(list.owner_at(10), Some("0xalice"));
        assert_eq!(list.owner_at(15), Some("0xbob"));
        assert_eq!(list.owner_at(26), Some("0xbob"));
        assert_eq!(list.owner_at(27), Some("0xcharlie"));
    }

    #[test]
    fn merge_unions_heights_and_owners() {
        let mut a = BlockIndexList::new();
        a.record_ownership_change(0, "0xalice");
        let mut b = BlockIndexList::new();
        b.append_height(8);
        b.record_ownership_change(15, "0xbob");
        a.merge(&b);
        assert_eq!(a.heights(), &[0, 8, 15]);
        assert_eq!(a.owner_at(15), Some("0xbob"));
    }

    #[test]
    fn check_rejects_owner_height_not_in_heights() {
        let list = BlockIndexList {
            heights: vec![0, 10],
            owners: vec![OwnerRecord {
                height: 5,
                address: "0xalice".into(),
            }],
        };
        assert!(!list.check());
    }

    #[test]
    fn from_parts_rejects_unsorted_heights() {
        assert!(BlockIndexList::from_parts(vec![10, 5], vec![]).is_none());
    }

    #[test]
    fn check_rejects_heights_starting_before_first_owner_record() {
        let list = BlockIndexList {
            heights: vec![0, 58],
            owners: vec![OwnerRecord {
                height: 38,
                address: "0xalice".into(),
            }],
        };
        assert!(!list.check());
    }
}
