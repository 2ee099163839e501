use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 1-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
    pub page: usize,
    pub limit: usize,
    #[serde(default)]
    pub order: SortOrder,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            order: SortOrder::Asc,
        }
    }
}

impl PageParams {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page,
            limit,
            order: SortOrder::Asc,
        }
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Zero page or limit falls back to the first page / default limit.
    fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: if self.limit == 0 { DEFAULT_PAGE_LIMIT } else { self.limit },
            order: self.order,
        }
    }

    /// Half-open `[from, to)` row range of this page within `total` rows.
    pub fn to_index(&self, total: usize) -> (usize, usize) {
        let p = self.normalized();
        let from = (p.page - 1).saturating_mul(p.limit).min(total);
        let to = from.saturating_add(p.limit).min(total);
        (from, to)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
    pub total_pages: usize,
    pub number_of_items: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub content: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Paginated<T> {
    /// Wraps an already-sliced page of a `total`-row collection.
    pub fn new(content: Vec<T>, page: usize, limit: usize, total: usize) -> Self {
        let p = PageParams::new(page, limit).normalized();
        Self {
            pagination: Pagination {
                page: p.page,
                size: p.limit,
                total_items: total,
                total_pages: total.div_ceil(p.limit),
                number_of_items: content.len(),
            },
            content,
        }
    }

    pub fn empty(params: PageParams) -> Self {
        Self::new(Vec::new(), params.page, params.limit, 0)
    }

    /// Orders `rows` (stored order is ascending) and slices out the page.
    pub fn paginate(mut rows: Vec<T>, params: PageParams) -> Self {
        if params.order == SortOrder::Desc {
            rows.reverse();
        }

        let total = rows.len();
        let (from, to) = params.to_index(total);
        let content: Vec<T> = rows.drain(from..to).collect();
        Self::new(content, params.page, params.limit, total)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            content: self.content.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}
