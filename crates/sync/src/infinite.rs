//! Offset-paginated list helper.

use log::debug;
use std::sync::Arc;

use crate::client::QueryClient;
use crate::error::{QueryError, QueryResult};
use stockyard_api::{ApiError, ListQuery, ResourceApi};
use stockyard_core::sync::{InfiniteData, Membership, Page};
use stockyard_core::{Entity, QueryKey};

/// A paginated list cached under one key as [`InfiniteData`].
pub struct InfiniteQuery<E: Entity> {
    client: QueryClient,
    api: Arc<dyn ResourceApi<E>>,
    key: QueryKey,
    query: ListQuery,
    page_size: u64,
    membership: Option<Membership<E>>,
}

impl<E: Entity> Clone for InfiniteQuery<E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            api: Arc::clone(&self.api),
            key: self.key.clone(),
            query: self.query.clone(),
            page_size: self.page_size,
            membership: self.membership.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for InfiniteQuery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQuery")
            .field("key", &self.key)
            .field("query", &self.query)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<E: Entity> InfiniteQuery<E> {
    pub fn new(
        client: QueryClient,
        api: Arc<dyn ResourceApi<E>>,
        key: QueryKey,
        query: ListQuery,
        page_size: u64,
    ) -> Self {
        Self {
            client,
            api,
            key,
            query,
            page_size: page_size.max(1),
            membership: None,
        }
    }

    /// Keep only rows passing `membership` in each fetched page. The
    /// end-of-data rule still counts the raw rows.
    pub fn with_membership(mut self, membership: Option<Membership<E>>) -> Self {
        self.membership = membership;
        self
    }


    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Load the first page, or serve the cached pages while fresh.
    /// Revalidation starts over from offset 0.
    pub async fn fetch(&self) -> QueryResult<Arc<InfiniteData<E>>> {
        let api = Arc::clone(&self.api);
        let limit = self.page_size;
        let query = self.query.clone().page(0, limit);
        let membership = self.membership.clone();
        self.client
            .fetch_query(self.key.clone(), move || async move {
                let data = api.list(&query).await?;
                let page = member_page(data, 0, limit, membership.as_ref());
                Ok::<_, ApiError>(InfiniteData::first(page, 0))
            })
            .await
    }

    /// Fetch and append the next page. Returns `false` without a request when
    /// there is no next page or a fetch for this key is already running.
    pub async fn fetch_next_page(&self) -> QueryResult<bool> {
        let Some(current) = self.client.get_query_data::<InfiniteData<E>>(&self.key)? else {
            self.fetch().await?;
            return Ok(true);
        };
        let Some(offset) = current.next_page_param() else {
            return Ok(false);
        };
        if self.client.is_fetching(&self.key) {
            debug!("[QueryCache] {} is refetching; next page skipped", self.key);
            return Ok(false);
        }
        let Some(_claim) = self.client.begin_page_fetch(&self.key) else {
            debug!("[QueryCache] Next page for {} already in flight", self.key);
            return Ok(false);
        };

        let query = self.query.clone().page(offset, self.page_size);
        let data = self
            .api
            .list(&query)
            .await
            .map_err(|err| QueryError::fetch(&self.key, err))?;
        let page = member_page(data, offset, self.page_size, self.membership.as_ref());

        // Pages reset by a refetch or a cache clear meanwhile are left alone.
        let appended = self
            .client
            .cache()
            .update_existing::<InfiniteData<E>, _>(&self.key, |pages| {
                (pages.next_page_param() == Some(offset)).then(|| pages.with_page(page, offset))
            })?;
        debug!(
            "[QueryCache] Page at offset {} for {} appended={}",
            offset, self.key, appended
        );
        Ok(appended)
    }

    pub fn data(&self) -> Option<Arc<InfiniteData<E>>> {
        self.client
            .get_query_data::<InfiniteData<E>>(&self.key)
            .ok()
            .flatten()
    }

    /// All loaded items in page order.
    pub fn items(&self) -> Vec<E> {
        self.data()
            .map(|data| data.items().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_next_page(&self) -> bool {
        self.data()
            .map(|data| data.has_next_page())
            .unwrap_or(false)
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.client.is_fetching_page(&self.key)
    }
}

fn member_page<E>(
    data: Vec<E>,
    offset: u64,
    limit: u64,
    membership: Option<&Membership<E>>,
) -> Page<E> {
    let mut page = Page::from_fetch(data, offset, limit);
    if let Some(member) = membership {
        page.data.retain(|row| member(row));
    }
    page
}
