//! Page-number pagination helpers.

use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("page numbers start at 1")]
    InvalidPage,
    #[error("page size must be between 1 and {max}, got {got}")]
    InvalidPageSize { got: u32, max: u32 },
}

/// One-based page number plus page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Result<Self, PaginationError> {
        if page == 0 {
            return Err(PaginationError::InvalidPage);
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(PaginationError::InvalidPageSize {
                got: page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        Ok(Self { page, page_size })
    }

    pub fn first(page_size: u32) -> Result<Self, PaginationError> {
        Self::new(1, page_size)
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            page_size: self.page_size,
        }
    }

    pub fn previous(&self) -> Option<Self> {
        (self.page > 1).then(|| Self {
            page: self.page - 1,
            page_size: self.page_size,
        })
    }

    pub fn range(&self) -> RowRange {
        RowRange {
            offset: u64::from(self.page - 1) * u64::from(self.page_size),
            limit: u64::from(self.page_size),
        }
    }

    /// More rows exist past this page.
    pub fn has_more(&self, total_count: u64) -> bool {
        total_count > u64::from(self.page) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Offset window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowRange {
    pub offset: u64,
    pub limit: u64,
}

impl RowRange {
    /// Inclusive index of the last row, as used by `Range: items=a-b`.
    pub fn last(&self) -> u64 {
        (self.offset + self.limit).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_page_and_oversized_pages() {
        assert_eq!(PageRequest::new(0, 20), Err(PaginationError::InvalidPage));
        assert!(matches!(
            PageRequest::new(1, 0),
            Err(PaginationError::InvalidPageSize { got: 0, .. })
        ));
        assert!(PageRequest::new(1, MAX_PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn range_covers_requested_window() {
        let third = PageRequest::new(3, 10).unwrap();
        assert_eq!(third.range(), RowRange { offset: 20, limit: 10 });
        assert_eq!(third.range().last(), 29);
        assert_eq!(third.previous().map(|p| p.page()), Some(2));
        assert_eq!(third.next().page(), 4);
        assert!(PageRequest::first(10).unwrap().previous().is_none());
    }

    #[test]
    fn has_more_compares_total_with_pages_seen() {
        let second = PageRequest::new(2, 10).unwrap();
        assert!(second.has_more(21));
        assert!(!second.has_more(20));
        assert!(!second.has_more(3));
    }
}
