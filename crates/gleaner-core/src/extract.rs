//! Selector-driven extraction over a parsed document.
//!
//! Flat mode yields one record per page. Item mode yields one record per
//! container match, with every field evaluated inside its container; an
//! item missing a required field is dropped and counted as skipped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::{
    ExtractedRecord, ExtractionMode, FieldSelector, FieldValue, ItemScraping, ScrapeConfig,
    Selector, clean_text,
};
use crate::traits::{NodeMatch, QueryDocument};

/// Attributes whose values are URLs resolved against the page.
const URL_ATTRIBUTES: [&str; 3] = ["href", "src", "data-src"];

/// Attributes consulted, in order, for an image's location.
const IMAGE_ATTRIBUTES: [&str; 3] = ["src", "data-src", "data-lazy-src"];

/// Everything extracted from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtraction {
    pub records: Vec<ExtractedRecord>,
    pub skipped_items: usize,
    /// Image URLs found on the page, in document order without repeats.
    pub images: Vec<String>,
}

/// Outcome of evaluating one selector interactively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorPreview {
    pub match_count: usize,
    pub preview_values: Vec<String>,
}

/// Run the configured extraction against `doc`, fetched from `page_url`.
///
/// Only an invalid container selector fails the page; field-level selector
/// errors are logged and treated as "no match".
pub fn extract<D: QueryDocument>(
    doc: &D,
    page_url: &str,
    config: &ScrapeConfig,
) -> Result<PageExtraction, AppError> {
    let base = Url::parse(page_url).ok();
    let image_selector = config.image_selector();

    match config.mode() {
        ExtractionMode::Flat { fields } => {
            let mut values = BTreeMap::new();
            for field in fields {
                let matched = match doc.select(None, &field.selector) {
                    Ok(matches) => field_values(matches, &field.selector, base.as_ref()),
                    Err(e) => {
                        tracing::warn!(field = %field.name, error = %e, "Field selector failed");
                        Vec::new()
                    }
                };
                values.insert(field.name.clone(), FieldValue::from_matches(matched));
            }

            let images = match &image_selector {
                Some(selector) => image_urls(doc.select(None, selector), base.as_ref()),
                None => Vec::new(),
            };

            let mut record = ExtractedRecord::new(page_url, values);
            record.images = images.clone();
            Ok(PageExtraction {
                records: vec![record],
                skipped_items: 0,
                images,
            })
        }
        ExtractionMode::Item { container, fields } => extract_items(
            doc,
            page_url,
            base.as_ref(),
            container,
            fields,
            image_selector.as_ref(),
        ),
    }
}

fn extract_items<D: QueryDocument>(
    doc: &D,
    page_url: &str,
    base: Option<&Url>,
    container: &ItemScraping,
    fields: &[FieldSelector],
    image_selector: Option<&Selector>,
) -> Result<PageExtraction, AppError> {
    let scopes = doc.scopes(&container.container())?;
    tracing::debug!(url = %page_url, containers = scopes.len(), "Found item containers");

    let mut extraction = PageExtraction::default();

    'items: for (index, scope) in scopes.into_iter().enumerate() {
        let mut values = BTreeMap::new();
        for field in fields {
            let matched = match doc.select(Some(scope), &field.selector) {
                Ok(matches) => field_values(matches, &field.selector, base),
                Err(e) => {
                    tracing::warn!(field = %field.name, error = %e, "Field selector failed");
                    Vec::new()
                }
            };
            if matched.is_empty() && field.required {
                tracing::debug!(
                    item = index + 1,
                    field = %field.name,
                    "Skipping item missing required field"
                );
                extraction.skipped_items += 1;
                continue 'items;
            }
            values.insert(field.name.clone(), FieldValue::from_matches(matched));
        }

        let mut record = ExtractedRecord::new(page_url, values);
        record.item_index = Some(index + 1);

        if let Some(selector) = image_selector {
            let image = image_field(&record.fields).or_else(|| {
                image_urls(doc.select(Some(scope), selector), base)
                    .into_iter()
                    .next()
            });
            if let Some(image) = image {
                if !extraction.images.contains(&image) {
                    extraction.images.push(image.clone());
                }
                record.images.push(image);
            }
        }

        extraction.records.push(record);
    }

    Ok(extraction)
}

/// Evaluate a single selector and report how many nodes matched plus the
/// first `limit` values.
pub fn preview<D: QueryDocument>(
    doc: &D,
    page_url: &str,
    selector: &Selector,
    limit: usize,
) -> Result<SelectorPreview, AppError> {
    let base = Url::parse(page_url).ok();
    let matches = doc.select(None, selector)?;
    let values = field_values(matches, selector, base.as_ref());
    Ok(SelectorPreview {
        match_count: values.len(),
        preview_values: values.into_iter().take(limit).collect(),
    })
}

fn field_values(matches: Vec<NodeMatch>, selector: &Selector, base: Option<&Url>) -> Vec<String> {
    match selector.attribute.as_deref() {
        Some(attribute) => matches
            .iter()
            .filter_map(|m| m.attribute(attribute))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                if URL_ATTRIBUTES.contains(&attribute) {
                    resolve(base, v)
                } else {
                    v.to_string()
                }
            })
            .collect(),
        None => matches
            .iter()
            .map(|m| clean_text(&m.text))
            .filter(|v| !v.is_empty())
            .collect(),
    }
}

fn image_urls(matches: Result<Vec<NodeMatch>, AppError>, base: Option<&Url>) -> Vec<String> {
    let matches = match matches {
        Ok(matches) => matches,
        Err(e) => {
            tracing::warn!(error = %e, "Image selector failed");
            return Vec::new();
        }
    };
    let mut urls: Vec<String> = Vec::new();
    for node in &matches {
        let source = IMAGE_ATTRIBUTES
            .iter()
            .filter_map(|a| node.attribute(a))
            .map(str::trim)
            .find(|v| !v.is_empty());
        if let Some(source) = source {
            let url = resolve(base, source);
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    urls
}

/// First field named like an image whose value is an absolute URL.
fn image_field(fields: &BTreeMap<String, FieldValue>) -> Option<String> {
    fields
        .iter()
        .filter(|(name, _)| {
            let name = name.to_lowercase();
            name.contains("image") || name.contains("img")
        })
        .filter_map(|(_, value)| value.first())
        .find(|v| v.starts_with("http://") || v.starts_with("https://"))
        .map(str::to_string)
}

fn resolve(base: Option<&Url>, value: &str) -> String {
    base.and_then(|b| b.join(value).ok())
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}
