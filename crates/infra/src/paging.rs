//! Paged iteration over large result sets.
//!
//! `paged_query` walks a `PageSource` one page at a time so that a batch job
//! never holds the whole collection in memory. An optional delay between pages
//! sheds load from the datastore.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// Datastore error surfaced by record sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The cursor of an open result set broke (e.g. the server dropped it at the end).
    #[error("operational error: {0}")]
    Operational(String),
    /// The store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Lazily evaluated page of results.
pub type PageIter<'a, T> = Box<dyn Iterator<Item = Result<T, StoreError>> + 'a>;

/// A countable, sliceable collection.
pub trait PageSource {
    type Item;

    /// Total number of items the source currently holds.
    fn count(&self) -> Result<usize, StoreError>;

    /// Items `[offset, offset + limit)`, resolved lazily.
    fn page(&self, offset: usize, limit: usize) -> PageIter<'_, Self::Item>;
}

impl<S: PageSource + ?Sized> PageSource for Box<S> {
    type Item = S::Item;

    fn count(&self) -> Result<usize, StoreError> {
        (**self).count()
    }

    fn page(&self, offset: usize, limit: usize) -> PageIter<'_, Self::Item> {
        (**self).page(offset, limit)
    }
}

/// Page source over an owned vector.
#[derive(Debug, Clone, Default)]
pub struct VecSource<T> {
    items: Vec<T>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T: Clone> PageSource for VecSource<T> {
    type Item = T;

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.items.len())
    }

    fn page(&self, offset: usize, limit: usize) -> PageIter<'_, T> {
        Box::new(self.items.iter().skip(offset).take(limit).cloned().map(Ok))
    }
}

/// Iterator returned by [`paged_query`].
///
/// Yields `(index, item)` with a 1-based index that is global across pages.
pub struct PagedQuery<'a, S>
where
    S: PageSource + ?Sized,
{
    source: &'a S,
    delay: Duration,
    page_size: usize,
    total: usize,
    pages: usize,
    next_page: usize,
    page_start: usize,
    index_in_page: usize,
    yielded: usize,
    current: Option<PageIter<'a, S::Item>>,
}

impl<'a, S> PagedQuery<'a, S>
where
    S: PageSource + ?Sized,
{
    /// Total captured when the query started.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Items yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn end_page_on_error(&mut self, err: &StoreError) {
        if self.yielded == self.total {
            info!(
                error = %err,
                yielded = self.yielded,
                "store error caught, all known results processed in paged query"
            );
        } else {
            warn!(
                error = %err,
                yielded = self.yielded,
                total = self.total,
                page_start = self.page_start,
                "store error caught, it is possible some results were missed"
            );
        }
        self.current = None;
    }
}

impl<'a, S> Iterator for PagedQuery<'a, S>
where
    S: PageSource + ?Sized,
{
    type Item = (usize, S::Item);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(page) = self.current.as_mut() {
                match page.next() {
                    Some(Ok(item)) => {
                        self.index_in_page += 1;
                        self.yielded += 1;
                        return Some((self.page_start + self.index_in_page, item));
                    }
                    Some(Err(err)) => {
                        self.end_page_on_error(&err);
                        continue;
                    }
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }

            if self.next_page >= self.pages {
                return None;
            }

            if self.next_page > 0 && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }

            self.page_start = self.next_page * self.page_size;
            self.index_in_page = 0;
            self.current = Some(self.source.page(self.page_start, self.page_size));
            self.next_page += 1;
        }
    }
}

/// Iterate `source` in pages of `page_size`, sleeping `delay` between pages.
///
/// Only the initial count can fail; errors while reading a page end that page
/// (see [`PagedQuery`]) and are never returned to the caller.
pub fn paged_query<S>(
    source: &S,
    delay: Duration,
    page_size: usize,
) -> Result<PagedQuery<'_, S>, StoreError>
where
    S: PageSource + ?Sized,
{
    let page_size = page_size.max(1);
    let total = source.count()?;
    let pages = total.div_ceil(page_size);

    Ok(PagedQuery {
        source,
        delay,
        page_size,
        total,
        pages,
        next_page: 0,
        page_start: 0,
        index_in_page: 0,
        yielded: 0,
        current: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Records the pages that were requested.
    struct RecordingSource {
        inner: VecSource<u32>,
        requested: Mutex<Vec<(usize, usize)>>,
    }

    impl RecordingSource {
        fn with_len(len: u32) -> Self {
            Self {
                inner: VecSource::new((1..=len).collect()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageSource for RecordingSource {
        type Item = u32;

        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }

        fn page(&self, offset: usize, limit: usize) -> PageIter<'_, u32> {
            self.requested.lock().unwrap().push((offset, limit));
            self.inner.page(offset, limit)
        }
    }

    /// Fails after yielding `fail_after` items of a given page.
    struct FlakySource {
        items: Vec<u32>,
        failing_page_offset: usize,
        fail_after: usize,
    }

    impl PageSource for FlakySource {
        type Item = u32;

        fn count(&self) -> Result<usize, StoreError> {
            Ok(self.items.len())
        }

        fn page(&self, offset: usize, limit: usize) -> PageIter<'_, u32> {
            let items: Vec<Result<u32, StoreError>> = self
                .items
                .iter()
                .skip(offset)
                .take(limit)
                .copied()
                .map(Ok)
                .collect();
            if offset == self.failing_page_offset {
                let mut truncated: Vec<_> = items.into_iter().take(self.fail_after).collect();
                truncated.push(Err(StoreError::Operational("cursor closed".into())));
                Box::new(truncated.into_iter())
            } else {
                Box::new(items.into_iter())
            }
        }
    }

    struct BrokenCount;

    impl PageSource for BrokenCount {
        type Item = u32;

        fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("db down".into()))
        }

        fn page(&self, _offset: usize, _limit: usize) -> PageIter<'_, u32> {
            Box::new(std::iter::empty())
        }
    }

    #[test]
    fn walks_205_items_in_three_pages() {
        let source = RecordingSource::with_len(205);
        let query = paged_query(&source, Duration::ZERO, 100).unwrap();
        assert_eq!(query.pages(), 3);

        let results: Vec<(usize, u32)> = query.collect();
        assert_eq!(results.len(), 205);
        assert_eq!(results.first(), Some(&(1, 1)));
        assert_eq!(results.last(), Some(&(205, 205)));
        assert!(results.windows(2).all(|w| w[1].0 == w[0].0 + 1));

        let requested = source.requested.lock().unwrap().clone();
        assert_eq!(requested, vec![(0, 100), (100, 100), (200, 100)]);

        let sizes: Vec<usize> = requested
            .iter()
            .map(|(offset, limit)| (205 - offset).min(*limit))
            .collect();
        assert_eq!(sizes, vec![100, 100, 5]);
    }

    #[test]
    fn pages_are_opened_lazily() {
        let source = RecordingSource::with_len(50);
        let mut query = paged_query(&source, Duration::ZERO, 10).unwrap();
        assert!(source.requested.lock().unwrap().is_empty());

        let first: Vec<_> = query.by_ref().take(11).collect();
        assert_eq!(first.len(), 11);
        assert_eq!(source.requested.lock().unwrap().len(), 2);
    }

    #[test]
    fn error_mid_page_skips_to_next_page() {
        let source = FlakySource {
            items: (1..=30).collect(),
            failing_page_offset: 10,
            fail_after: 4,
        };

        let results: Vec<(usize, u32)> = paged_query(&source, Duration::ZERO, 10).unwrap().collect();
        let items: Vec<u32> = results.iter().map(|(_, item)| *item).collect();

        let mut expected: Vec<u32> = (1..=14).collect();
        expected.extend(21..=30);
        assert_eq!(items, expected);
        assert_eq!(results[10], (11, 11));
        assert_eq!(results[14], (21, 21));
    }

    #[test]
    fn error_after_last_item_is_a_quiet_end() {
        let source = FlakySource {
            items: (1..=5).collect(),
            failing_page_offset: 0,
            fail_after: 5,
        };

        let mut query = paged_query(&source, Duration::ZERO, 10).unwrap();
        let results: Vec<_> = query.by_ref().collect();
        assert_eq!(results.len(), 5);
        assert_eq!(query.yielded(), query.total());
    }

    #[test]
    fn count_failure_is_returned() {
        let err = paged_query(&BrokenCount, Duration::ZERO, 10).err();
        assert_eq!(err, Some(StoreError::Unavailable("db down".into())));
    }

    #[test]
    fn empty_source_yields_nothing() {
        let source = VecSource::<u32>::new(Vec::new());
        let query = paged_query(&source, Duration::from_secs(5), 100).unwrap();
        assert_eq!(query.pages(), 0);
        assert_eq!(query.count(), 0);
    }

    #[test]
    fn delay_only_between_pages() {
        let source = VecSource::new((1..=3).collect::<Vec<u32>>());
        let started = Instant::now();
        let all: Vec<_> = paged_query(&source, Duration::from_millis(20), 1).unwrap().collect();
        assert_eq!(all.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn zero_page_size_is_treated_as_one() {
        let source = VecSource::new(vec![1u32, 2]);
        let query = paged_query(&source, Duration::ZERO, 0).unwrap();
        assert_eq!(query.pages(), 2);
        assert_eq!(query.count(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: every item is yielded once, in order, with indices 1..=len.
        #[test]
        fn yields_each_item_once_with_global_indices(len in 0u32..400, page_size in 1usize..120) {
            let source = VecSource::new((0..len).collect::<Vec<u32>>());
            let results: Vec<_> = paged_query(&source, Duration::ZERO, page_size).unwrap().collect();

            prop_assert_eq!(results.len(), len as usize);
            for (pos, (index, item)) in results.iter().enumerate() {
                prop_assert_eq!(*index, pos + 1);
                prop_assert_eq!(*item as usize, pos);
            }
        }
    }
}
