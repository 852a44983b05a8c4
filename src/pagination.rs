use serde::{Deserialize, Serialize};

const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}
fn default_limit() -> i64 {
    10
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PageQuery {
    /// Clamp to sane bounds: page ≥ 1, 1 ≤ limit ≤ 100.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

/// A page of rows plus the total number of matches.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(query: PageQuery, total: i64) -> Self {
        let pages = if total == 0 {
            0
        } else {
            (total + query.limit - 1) / query.limit
        };
        Self {
            page: query.page,
            limit: query.limit,
            total,
            pages,
        }
    }
}

/// Listing response body: `{success, data, pagination}`.
#[derive(Debug, Serialize)]
pub struct Paginated<T: Serialize> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T: Serialize> Paginated<T> {
    pub fn new(query: PageQuery, page: Page<T>) -> Self {
        Self {
            success: true,
            pagination: Pagination::new(query, page.total),
            data: page.items,
        }
    }
}

/// Slice an in-memory collection the way `LIMIT/OFFSET` would.
#[cfg(test)]
pub fn paginate<T: Clone>(rows: &[T], query: PageQuery) -> Page<T> {
    let items = rows
        .iter()
        .skip(query.offset() as usize)
        .take(query.limit as usize)
        .cloned()
        .collect();
    Page {
        items,
        total: rows.len() as i64,
    }
}
