//! Query engine: bounded, cursor-paginated range reads.
//!
//! Every query walks one secondary index in `(block, hash)` order and stops
//! after `limit` records. The cursor carries the position, so the ledger
//! keeps no per-query state.

use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::types::{BlockRange, Cursor, InteractionRecord, ScanFilter};

/// One page of results.
#[derive(Clone, Debug)]
pub struct Page {
    pub records: Vec<InteractionRecord>,
    /// Present when the page is full and more records may follow.
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

impl Ledger {
    /// Run a query over any grouping.
    pub fn query(
        &self,
        filter: ScanFilter,
        range: BlockRange,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        if limit == 0 {
            return Err(LedgerError::InvalidQuery("limit must be at least 1".into()));
        }

        let mut scan = self.store.scan(filter, range, cursor)?;
        let mut records = Vec::with_capacity(limit.min(self.config().scan_batch_size.max(1)));
        while records.len() < limit {
            match scan.next() {
                Some(record) => records.push(record?),
                None => break,
            }
        }

        let next_cursor = if records.len() == limit {
            scan.cursor()
        } else {
            None
        };
        Ok(Page {
            records,
            next_cursor,
        })
    }

    /// Interactions with `contract` on `chain`.
    pub fn query_by_contract(
        &self,
        chain: &str,
        contract: &str,
        range: BlockRange,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        let filter = ScanFilter::contract(chain.trim(), self.validator.normalize(contract));
        self.query(filter, range, limit, cursor)
    }

    /// Interactions initiated by `address` on `chain`.
    pub fn query_by_address(
        &self,
        chain: &str,
        address: &str,
        range: BlockRange,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        let filter = ScanFilter::address(chain.trim(), self.validator.normalize(address));
        self.query(filter, range, limit, cursor)
    }

    /// Every interaction on `chain`.
    pub fn query_by_chain(
        &self,
        chain: &str,
        range: BlockRange,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        self.query(ScanFilter::chain(chain.trim()), range, limit, cursor)
    }

    /// Lazily walk a query page by page. Drop the iterator to stop.
    pub fn pages(&self, filter: ScanFilter, range: BlockRange, page_size: usize) -> Result<PageIter<'_>> {
        if page_size == 0 {
            return Err(LedgerError::InvalidQuery("page size must be at least 1".into()));
        }
        Ok(PageIter {
            ledger: self,
            filter,
            range,
            page_size,
            cursor: None,
            done: false,
        })
    }
}

/// Iterator over successive non-empty pages of one query.
pub struct PageIter<'a> {
    ledger: &'a Ledger,
    filter: ScanFilter,
    range: BlockRange,
    page_size: usize,
    cursor: Option<Cursor>,
    done: bool,
}

impl<'a> PageIter<'a> {
    /// Where the next page would start; hand it to a later query to resume.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }
}

impl<'a> Iterator for PageIter<'a> {
    type Item = Result<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.ledger.query(
            self.filter.clone(),
            self.range,
            self.page_size,
            self.cursor.as_ref(),
        ) {
            Ok(page) => {
                self.done = page.next_cursor.is_none();
                if page.next_cursor.is_some() {
                    self.cursor = page.next_cursor.clone();
                }
                if page.is_empty() {
                    None
                } else {
                    Some(Ok(page))
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestEvent;
    use crate::store::LedgerConfig;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> Ledger {
        Ledger::create(LedgerConfig {
            path: dir.path().join("ledger"),
            scan_batch_size: 3,
            ..Default::default()
        })
        .unwrap()
    }

    fn seed(ledger: &Ledger, count: i64) {
        for i in 0..count {
            ledger
                .ingest(IngestEvent::new(format!("0x{i:04}"), i, "0xaaa", "0xccc", "eth"))
                .unwrap();
        }
    }

    #[test]
    fn test_zero_limit_is_invalid() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);

        assert!(matches!(
            ledger.query_by_chain("eth", BlockRange::all(), 0, None),
            Err(LedgerError::InvalidQuery(_))
        ));
        assert!(matches!(
            ledger.pages(ScanFilter::chain("eth"), BlockRange::all(), 0),
            Err(LedgerError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_full_page_carries_cursor() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        seed(&ledger, 5);

        let first = ledger
            .query_by_contract("eth", "0xCCC", BlockRange::all(), 2, None)
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.has_more());

        let second = ledger
            .query_by_contract("eth", "0xccc", BlockRange::all(), 2, first.next_cursor.as_ref())
            .unwrap();
        let blocks: Vec<u64> = second.records.iter().map(|r| r.block).collect();
        assert_eq!(blocks, vec![2, 3]);

        let last = ledger
            .query_by_contract("eth", "0xccc", BlockRange::all(), 2, second.next_cursor.as_ref())
            .unwrap();
        assert_eq!(last.len(), 1);
        assert!(!last.has_more());
    }

    #[test]
    fn test_cursor_from_other_scope_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        seed(&ledger, 3);

        let page = ledger
            .query_by_address("eth", "0xaaa", BlockRange::all(), 1, None)
            .unwrap();
        let cursor = page.next_cursor.unwrap();

        assert!(matches!(
            ledger.query_by_contract("eth", "0xccc", BlockRange::all(), 1, Some(&cursor)),
            Err(LedgerError::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_pages_walks_everything() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        seed(&ledger, 7);

        let sizes: Vec<usize> = ledger
            .pages(ScanFilter::chain("eth"), BlockRange::new(1, 6), 2)
            .unwrap()
            .map(|p| p.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 2]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        seed(&ledger, 3);

        let page = ledger
            .query_by_chain("eth", BlockRange::new(2, 1), 10, None)
            .unwrap();
        assert!(page.is_empty());
        assert!(!page.has_more());
    }
}
