//! CSS and XPath evaluation over fetched HTML.
//!
//! CSS runs on a `scraper` tree. XPath runs on an `sxd` tree built lazily
//! from the same source, the first time an XPath selector is used. When a
//! container found by one language scopes a field written in the other, the
//! container's markup is re-parsed into the other tree.

use std::borrow::Cow;
use std::cell::OnceCell;
use std::fmt::Write as _;

use gleaner_core::error::AppError;
use gleaner_core::models::{Selector, SelectorLanguage};
use gleaner_core::traits::{NodeMatch, QueryDocument, StructuredQuery};
use scraper::{ElementRef, Html};
use sxd_document::Package;
use sxd_document::dom::{ChildOfElement, ChildOfRoot, Element};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value, XPath};

/// Elements with no closing tag.
const VOID_ELEMENTS: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Parses HTML into [`HtmlDocument`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlQuery;

impl StructuredQuery for HtmlQuery {
    type Document = HtmlDocument;

    fn parse(&self, html: &str) -> HtmlDocument {
        HtmlDocument::parse(html)
    }
}

/// A parsed page, queryable with CSS and XPath.
pub struct HtmlDocument {
    html: Html,
    source: String,
    tree: OnceCell<Package>,
}

/// A container node, in whichever tree found it.
#[derive(Clone, Copy)]
pub enum HtmlScope<'a> {
    Css(ElementRef<'a>),
    Xpath(Element<'a>),
}

impl HtmlDocument {
    pub fn parse(source: &str) -> Self {
        Self {
            html: Html::parse_document(source),
            source: source.to_string(),
            tree: OnceCell::new(),
        }
    }

    fn tree(&self) -> &Package {
        self.tree.get_or_init(|| sxd_html::parse_html(&self.source))
    }
}

impl QueryDocument for HtmlDocument {
    type Scope<'a>
        = HtmlScope<'a>
    where
        Self: 'a;

    fn scopes(&self, selector: &Selector) -> Result<Vec<HtmlScope<'_>>, AppError> {
        match selector.language {
            SelectorLanguage::Css => {
                let css = parse_css(&selector.expression)?;
                Ok(self.html.select(&css).map(HtmlScope::Css).collect())
            }
            SelectorLanguage::Xpath => {
                let xpath = compile_xpath(&selector.expression)?;
                let document = self.tree().as_document();
                let value = evaluate(&xpath, &selector.expression, document.root())?;
                let Value::Nodeset(nodes) = value else {
                    return Ok(Vec::new());
                };
                Ok(nodes
                    .document_order()
                    .into_iter()
                    .filter_map(|node| match node {
                        Node::Element(element) => Some(HtmlScope::Xpath(element)),
                        _ => None,
                    })
                    .collect())
            }
        }
    }

    fn select<'a>(
        &'a self,
        scope: Option<HtmlScope<'a>>,
        selector: &Selector,
    ) -> Result<Vec<NodeMatch>, AppError> {
        let expression = selector.expression.as_str();
        match (scope, selector.language) {
            (None, SelectorLanguage::Css) => {
                let css = parse_css(expression)?;
                Ok(self.html.select(&css).map(element_match).collect())
            }
            (None, SelectorLanguage::Xpath) => {
                let xpath = compile_xpath(expression)?;
                let document = self.tree().as_document();
                Ok(value_matches(evaluate(&xpath, expression, document.root())?))
            }
            (Some(HtmlScope::Css(container)), SelectorLanguage::Css) => {
                let css = parse_css(expression)?;
                Ok(container.select(&css).map(element_match).collect())
            }
            (Some(HtmlScope::Xpath(container)), SelectorLanguage::Xpath) => {
                let xpath = compile_xpath(&relative(expression)?)?;
                Ok(value_matches(evaluate(&xpath, expression, container)?))
            }
            (Some(HtmlScope::Css(container)), SelectorLanguage::Xpath) => {
                let xpath = compile_xpath(&relative(expression)?)?;
                let tag = container.value().name();
                let package = sxd_html::parse_html(&wrap_fragment(tag, &container.html()));
                let document = package.as_document();
                let Some(rebuilt) = find_sxd_element(&document, tag) else {
                    return Ok(Vec::new());
                };
                Ok(value_matches(evaluate(&xpath, expression, rebuilt)?))
            }
            (Some(HtmlScope::Xpath(container)), SelectorLanguage::Css) => {
                let css = parse_css(expression)?;
                let tag = container.name().local_part();
                let mut markup = String::new();
                write_outer_html(container, &mut markup);
                let fragment = Html::parse_fragment(&wrap_fragment(tag, &markup));
                let rebuilt = parse_css(tag)
                    .ok()
                    .and_then(|s| fragment.select(&s).next())
                    .unwrap_or_else(|| fragment.root_element());
                Ok(rebuilt.select(&css).map(element_match).collect())
            }
        }
    }
}

fn parse_css(expression: &str) -> Result<scraper::Selector, AppError> {
    scraper::Selector::parse(expression).map_err(|e| AppError::InvalidSelector {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn compile_xpath(expression: &str) -> Result<XPath, AppError> {
    let invalid = |message: String| AppError::InvalidSelector {
        expression: expression.to_string(),
        message,
    };
    Factory::new()
        .build(expression)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("empty expression".to_string()))
}

fn evaluate<'d>(
    xpath: &XPath,
    expression: &str,
    node: impl Into<Node<'d>>,
) -> Result<Value<'d>, AppError> {
    xpath
        .evaluate(&Context::new(), node)
        .map_err(|e| AppError::InvalidSelector {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

/// Every absolute location path is re-anchored at the container: each
/// branch of a union, function arguments, operands. Inside a predicate the
/// context node is no longer the container, so an absolute path there is
/// rejected rather than allowed to escape.
fn relative(expression: &str) -> Result<Cow<'_, str>, AppError> {
    let mut out = String::with_capacity(expression.len() + 4);
    let mut chars = expression.chars().peekable();
    let mut quote = None;
    let mut predicate_depth = 0usize;
    let mut anchored = false;

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            out.push(c);
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '[' => predicate_depth += 1,
            ']' => predicate_depth = predicate_depth.saturating_sub(1),
            '/' if starts_path(&out) => {
                if predicate_depth > 0 {
                    return Err(AppError::InvalidSelector {
                        expression: expression.to_string(),
                        message: "absolute path inside a predicate cannot be scoped to a container"
                            .to_string(),
                    });
                }
                out.push_str("./");
                if chars.next_if_eq(&'/').is_some() {
                    out.push('/');
                }
                anchored = true;
                continue;
            }
            _ => {}
        }
        out.push(c);
    }

    Ok(if anchored {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(expression)
    })
}

/// Whether a `/` following `before` opens a new location path rather than
/// separating two steps.
fn starts_path(before: &str) -> bool {
    let trimmed = before.trim_end();
    let Some(last) = trimmed.chars().next_back() else {
        return true;
    };
    if matches!(last, '(' | ',' | '|' | '[' | '=' | '<' | '>' | '+') {
        return true;
    }
    let spaced = |rest: &str| rest.ends_with(char::is_whitespace);
    if last == '-' {
        return spaced(&trimmed[..trimmed.len() - 1]);
    }
    ["and", "or", "div", "mod"]
        .iter()
        .any(|op| trimmed.strip_suffix(op).is_some_and(spaced))
}

/// Table parts are dropped by the HTML parser outside a table.
fn wrap_fragment(tag: &str, markup: &str) -> String {
    match tag {
        "tr" | "thead" | "tbody" | "tfoot" => format!("<table>{markup}</table>"),
        "td" | "th" => format!("<table><tr>{markup}</tr></table>"),
        _ => markup.to_string(),
    }
}

fn element_match(element: ElementRef<'_>) -> NodeMatch {
    let mut node = NodeMatch::text(element.text().collect::<String>());
    for (name, value) in element.value().attrs() {
        node = node.with_attribute(name, value);
    }
    node
}

fn value_matches(value: Value<'_>) -> Vec<NodeMatch> {
    match value {
        Value::Nodeset(nodes) => nodes
            .document_order()
            .into_iter()
            .map(|node| match node {
                Node::Element(element) => {
                    let mut matched = NodeMatch::text(Node::Element(element).string_value());
                    for attribute in element.attributes() {
                        matched =
                            matched.with_attribute(attribute.name().local_part(), attribute.value());
                    }
                    matched
                }
                other => NodeMatch::text(other.string_value()),
            })
            .collect(),
        Value::String(s) => vec![NodeMatch::text(s)],
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => {
            vec![NodeMatch::text(format!("{}", n as i64))]
        }
        Value::Number(n) => vec![NodeMatch::text(n.to_string())],
        Value::Boolean(b) => vec![NodeMatch::text(b.to_string())],
    }
}

fn find_sxd_element<'d>(
    document: &sxd_document::dom::Document<'d>,
    tag: &str,
) -> Option<Element<'d>> {
    document.root().children().into_iter().find_map(|child| match child {
        ChildOfRoot::Element(element) => find_in(element, tag),
        _ => None,
    })
}

fn find_in<'d>(element: Element<'d>, tag: &str) -> Option<Element<'d>> {
    if element.name().local_part() == tag {
        return Some(element);
    }
    element.children().into_iter().find_map(|child| match child {
        ChildOfElement::Element(inner) => find_in(inner, tag),
        _ => None,
    })
}

fn write_outer_html(element: Element<'_>, out: &mut String) {
    let name = element.name().local_part();
    out.push('<');
    out.push_str(name);
    for attribute in element.attributes() {
        let _ = write!(
            out,
            " {}=\"{}\"",
            attribute.name().local_part(),
            escape(attribute.value(), true)
        );
    }
    out.push('>');
    if VOID_ELEMENTS.contains(&name) {
        return;
    }
    for child in element.children() {
        match child {
            ChildOfElement::Element(inner) => write_outer_html(inner, out),
            ChildOfElement::Text(text) => out.push_str(&escape(text.text(), false)),
            _ => {}
        }
    }
    let _ = write!(out, "</{name}>");
}

fn escape(text: &str, attribute: bool) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' if attribute => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
