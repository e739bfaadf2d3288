use std::future::Future;

use crate::models::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageConfig {
    pub page_size: u32,
    pub limit: Option<usize>,
}

/// Accumulates pages starting at page 1 until the limit is reached, a page
/// comes back short, or the reported total is exhausted.
///
/// The page size is clamped to the limit on the first request only. Tableau
/// derives the offset from `pageNumber * pageSize`, so shrinking the size on
/// a later page would skip rows; the final page is instead truncated in
/// memory.
pub async fn paginate<T, E, F, Fut>(config: PageConfig, mut fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(u32, u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    if config.limit == Some(0) {
        return Ok(Vec::new());
    }

    let preferred = config.page_size.max(1);
    let request_size = match config.limit {
        Some(limit) => u32::try_from(limit).map_or(preferred, |limit| preferred.min(limit)),
        None => preferred,
    };

    let mut items = Vec::new();
    let mut page_number = 1u32;
    loop {
        let page = fetch(page_number, request_size).await?;
        let fetched = page.items.len();
        let total_available = u64::from(page.pagination.total_available);
        items.extend(page.items);

        if let Some(limit) = config.limit {
            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
        }

        if fetched < request_size as usize {
            break;
        }

        if u64::from(page_number) * u64::from(request_size) >= total_available {
            break;
        }

        page_number += 1;
    }

    Ok(items)
}
