use gleaner_client::HtmlQuery;
use gleaner_core::extract::{extract, preview};
use gleaner_core::{FieldSelector, FieldValue, ScrapeConfig, Selector, StructuredQuery};

use crate::integration::common::catalogue_page;

const PAGE_URL: &str = "https://books.example/catalogue/?page=1";

fn item_config() -> ScrapeConfig {
    ScrapeConfig::new(PAGE_URL).with_items(
        Selector::css("article.product_pod"),
        vec![
            FieldSelector::new("title", Selector::css("h3 a").with_attribute("title")),
            FieldSelector::new("link", Selector::css("h3 a").with_attribute("href")),
            FieldSelector::new("price", Selector::xpath(".//p[@class='price']")).required(),
        ],
    )
}

#[test]
fn test_item_mode_over_real_markup() {
    let doc = HtmlQuery.parse(&catalogue_page(1));
    let out = extract(&doc, PAGE_URL, &item_config()).unwrap();

    assert_eq!(out.records.len(), 2);
    assert_eq!(out.skipped_items, 1);

    let first = &out.records[0];
    assert_eq!(first.item_index, Some(1));
    assert_eq!(first.fields["title"], FieldValue::Single("Book 1".into()));
    assert_eq!(
        first.fields["link"],
        FieldValue::Single("https://books.example/item/1/index.html".into())
    );
    assert_eq!(first.fields["price"], FieldValue::Single("£1.00".into()));
    assert_eq!(out.records[1].item_index, Some(3));
}

#[test]
fn test_item_images_resolve_lazy_sources() {
    let doc = HtmlQuery.parse(&catalogue_page(2));
    let config = item_config().with_images("img");
    let out = extract(&doc, PAGE_URL, &config).unwrap();

    assert_eq!(
        out.images,
        vec![
            "https://books.example/media/4.jpg".to_string(),
            "https://books.example/media/6.jpg".to_string(),
        ]
    );
    assert_eq!(out.records[0].images, vec![out.images[0].clone()]);
}

#[test]
fn test_flat_mode_mixes_selector_languages() {
    let doc = HtmlQuery.parse(&catalogue_page(1));
    let config = ScrapeConfig::new(PAGE_URL)
        .with_field(FieldSelector::new("page_title", Selector::css("title")))
        .with_field(FieldSelector::new("heading", Selector::xpath("//h1")))
        .with_field(FieldSelector::new("books", Selector::css("h3 a")))
        .with_field(FieldSelector::new("broken", Selector::css("h3 a[")));

    let out = extract(&doc, PAGE_URL, &config).unwrap();
    let fields = &out.records[0].fields;

    assert_eq!(
        fields["page_title"],
        FieldValue::Single("All products | Page 1".into())
    );
    assert_eq!(fields["heading"], FieldValue::Single("All products".into()));
    assert_eq!(
        fields["books"],
        FieldValue::Multiple(vec!["Book 1".into(), "Book 2".into(), "Book 3".into()])
    );
    assert!(fields["broken"].is_empty());
}

#[test]
fn test_preview_counts_xpath_matches() {
    let doc = HtmlQuery.parse(&catalogue_page(1));
    let shown = preview(&doc, PAGE_URL, &Selector::xpath("//p[@class='price']"), 1).unwrap();

    assert_eq!(shown.match_count, 2);
    assert_eq!(shown.preview_values, vec!["£1.00".to_string()]);
}
