use serde::Serialize;

use crate::validator::Validator;

/// Query parameters accepted by the comment listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentFilters {
    pub content: String,
    pub author: String,
    pub page: u32,
    pub page_size: u32,
}

impl Default for CommentFilters {
    fn default() -> Self {
        Self {
            content: String::new(),
            author: String::new(),
            page: 1,
            page_size: 20,
        }
    }
}

impl CommentFilters {
    pub fn validate(&self, v: &mut Validator) {
        v.check(self.page > 0, "page", "must be greater than zero");
        v.check(self.page <= 10_000_000, "page", "must be a maximum of 10 million");
        v.check(self.page_size > 0, "page_size", "must be greater than zero");
        v.check(self.page_size <= 100, "page_size", "must be a maximum of 100");
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

/// Pagination summary returned next to a listing. Empty when nothing matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

impl Metadata {
    pub fn calculate(total_records: u64, page: u32, page_size: u32) -> Self {
        if total_records == 0 || page_size == 0 {
            return Self::default();
        }
        Self {
            current_page: Some(page),
            page_size: Some(page_size),
            first_page: Some(1),
            last_page: Some(total_records.div_ceil(u64::from(page_size))),
            total_records: Some(total_records),
        }
    }
}
