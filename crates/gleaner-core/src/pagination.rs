//! Range-driven page URL generation.
//!
//! The walker never looks at page content: it yields exactly one URL per
//! page number in `start_page..=end_page`, lazily and in order.

use std::iter::FusedIterator;

use url::Url;

use crate::error::AppError;
use crate::models::{PaginationConfig, PaginationStyle};

const PAGE_PLACEHOLDER: &str = "{page}";

/// Lazy, ordered sequence of page URLs.
#[derive(Debug, Clone)]
pub struct PageUrls {
    base: String,
    config: Option<PaginationConfig>,
    next: u32,
    end: u32,
    done: bool,
}

/// Produce the page URLs for `base_url` under `pagination`.
///
/// Disabled or absent pagination yields the base URL alone.
pub fn pages(base_url: &str, pagination: Option<&PaginationConfig>) -> Result<PageUrls, AppError> {
    let config = pagination.filter(|p| p.enabled).cloned();

    let (next, end) = match &config {
        Some(p) if p.start_page > p.end_page => {
            return Err(AppError::ValidationError(format!(
                "pagination startPage ({}) must not exceed endPage ({})",
                p.start_page, p.end_page
            )));
        }
        Some(p) => (p.start_page, p.end_page),
        None => (0, 0),
    };

    let probe = base_url.replace(PAGE_PLACEHOLDER, &next.to_string());
    Url::parse(&probe)
        .map_err(|e| AppError::ValidationError(format!("invalid url '{base_url}': {e}")))?;

    Ok(PageUrls {
        base: base_url.to_string(),
        config,
        next,
        end,
        done: false,
    })
}

impl PageUrls {
    fn url_for(&self, page: u32) -> String {
        let Some(config) = &self.config else {
            return self.base.clone();
        };
        if self.base.contains(PAGE_PLACEHOLDER) {
            return self.base.replace(PAGE_PLACEHOLDER, &page.to_string());
        }
        // Parsing was checked in `pages`, so failures cannot happen here.
        let Ok(mut url) = Url::parse(&self.base) else {
            return self.base.clone();
        };
        match config.style {
            PaginationStyle::Query => set_query_param(&mut url, &config.param_name, page),
            PaginationStyle::Path => append_path_segment(&mut url, page),
        }
        url.into()
    }
}

fn set_query_param(url: &mut Url, name: &str, page: u32) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    let mut pairs = url.query_pairs_mut();
    pairs.extend_pairs(kept);
    pairs.append_pair(name, &page.to_string());
}

fn append_path_segment(url: &mut Url, page: u32) {
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(&page.to_string());
    }
}

impl Iterator for PageUrls {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let url = self.url_for(self.next);
        if self.next >= self.end {
            self.done = true;
        } else {
            self.next += 1;
        }
        Some(url)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.done {
            0
        } else {
            (self.end - self.next) as usize + 1
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PageUrls {}

impl FusedIterator for PageUrls {}
