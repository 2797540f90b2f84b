//! Offset-paginated page lists.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::entities::Entity;

/// One fetched page. `next_offset` is `None` iff the page came back short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<E> {
    pub data: Vec<E>,
    pub next_offset: Option<u64>,
}

impl<E> Page<E> {
    /// Build a page from the raw fetch result for `offset`/`limit`.
    pub fn from_fetch(data: Vec<E>, offset: u64, limit: u64) -> Self {
        let next_offset = if (data.len() as u64) < limit {
            None
        } else {
            Some(offset + limit)
        };
        Self { data, next_offset }
    }
}

/// Pages of a list in fetch order, with the offset each was requested at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData<E> {
    pub pages: Vec<Page<E>>,
    pub page_params: Vec<u64>,
}

impl<E> Default for InfiniteData<E> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<E: Entity> InfiniteData<E> {
    pub fn first(page: Page<E>, offset: u64) -> Self {
        Self {
            pages: vec![page],
            page_params: vec![offset],
        }
    }

    /// Concatenation of all pages.
    pub fn items(&self) -> impl Iterator<Item = &E> {
        self.pages.iter().flat_map(|page| page.data.iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_page_param(&self) -> Option<u64> {
        self.pages.last().and_then(|page| page.next_offset)
    }

    pub fn has_next_page(&self) -> bool {
        self.next_page_param().is_some()
    }

    /// Append a page, dropping items already present in earlier pages.
    ///
    /// Offsets shift when items are inserted at the head server-side, so the
    /// next page can repeat the tail of the previous one. `next_offset` is kept
    /// from the raw fetch so the end-of-data rule still holds.
    pub fn with_page(&self, page: Page<E>, offset: u64) -> Self {
        let seen: HashSet<&str> = self.items().map(|item| item.id()).collect();
        let data: Vec<E> = page
            .data
            .into_iter()
            .filter(|item| !seen.contains(item.id()))
            .collect();

        let mut pages = self.pages.clone();
        pages.push(Page {
            data,
            next_offset: page.next_offset,
        });
        let mut page_params = self.page_params.clone();
        page_params.push(offset);
        Self { pages, page_params }
    }

    /// Locate an item by id as `(page, index)`.
    pub fn position(&self, id: &str) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(page_idx, page)| {
            page.data
                .iter()
                .position(|item| item.id() == id)
                .map(|idx| (page_idx, idx))
        })
    }
}
