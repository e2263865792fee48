// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset-based page cursor.
//!
//! A short page (fewer rows than requested) marks the end, so callers never
//! issue a trailing empty query unless the total is an exact multiple.

use std::future::Future;

#[derive(Debug, Clone)]
pub struct PageCursor {
    offset: u64,
    page_size: usize,
    exhausted: bool,
}

impl PageCursor {
    /// `page_size` of 0 is bumped to 1.
    pub fn new(page_size: usize) -> Self {
        Self {
            offset: 0,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Record that a page of `returned` rows was consumed.
    pub fn advance(&mut self, returned: usize) {
        self.offset += returned as u64;
        if returned < self.page_size {
            self.exhausted = true;
        }
    }

    /// Fetch the next page with `fetch(offset, limit)`. `None` once exhausted.
    pub async fn next_page<F, Fut, T, E>(&mut self, fetch: F) -> Result<Option<Vec<T>>, E>
    where
        F: FnOnce(u64, usize) -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        if self.exhausted {
            return Ok(None);
        }
        let page = fetch(self.offset, self.page_size).await?;
        self.advance(page.len());
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fetch(data: &[u32], offset: u64, limit: usize) -> Result<Vec<u32>, String> {
        Ok(data.iter().skip(offset as usize).take(limit).copied().collect())
    }

    #[tokio::test]
    async fn test_walks_all_pages() {
        let data: Vec<u32> = (0..7).collect();
        let mut cursor = PageCursor::new(3);
        let mut seen = Vec::new();
        let mut pages = 0;
        while let Some(page) = cursor.next_page(|o, l| fetch(&data, o, l)).await.unwrap() {
            pages += 1;
            seen.extend(page);
        }
        assert_eq!(seen, data);
        assert_eq!(pages, 3);
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_page() {
        let data: Vec<u32> = (0..6).collect();
        let mut cursor = PageCursor::new(3);
        let mut pages = 0;
        while let Some(_) = cursor.next_page(|o, l| fetch(&data, o, l)).await.unwrap() {
            pages += 1;
        }
        assert_eq!(pages, 2);
        assert_eq!(cursor.offset(), 6);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut cursor = PageCursor::new(10);
        let page = cursor.next_page(|o, l| fetch(&[], o, l)).await.unwrap();
        assert!(page.is_none());
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_error_propagates_without_advancing() {
        let mut cursor = PageCursor::new(2);
        let result: Result<Option<Vec<u32>>, String> =
            cursor.next_page(|_, _| async { Err("disk".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(cursor.offset(), 0);
        assert!(!cursor.is_exhausted());
    }

    #[test]
    fn test_zero_page_size_bumped() {
        assert_eq!(PageCursor::new(0).page_size(), 1);
    }
}
