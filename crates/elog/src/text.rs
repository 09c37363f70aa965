//! HTML body cleaning.

use scraper::Html;

/// Strip tags from a logbook body and collapse whitespace runs.
///
/// Entries are authored in a rich-text editor, so bodies arrive as HTML
/// fragments with nested markup, `&nbsp;` runs and hard line breaks.
pub fn clean_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    normalize_whitespace(&text)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
