use regex::Regex;

use crate::app::Result;
use crate::domain::ParsedFeed;
use crate::processor::ParserProcessor;

/// Removes active content from article descriptions: script, style and
/// iframe elements along with inline event handlers.
pub struct CleanupHtml {
    elements: Vec<Regex>,
    handlers: Regex,
}

impl CleanupHtml {
    pub fn new() -> Result<Self> {
        let elements = ["script", "style", "iframe"]
            .iter()
            .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>|<{tag}\b[^>]*/>")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            elements,
            handlers: Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#)?,
        })
    }

    fn clean(&self, html: &str) -> String {
        let mut cleaned = html.to_string();
        for element in &self.elements {
            cleaned = element.replace_all(&cleaned, "").into_owned();
        }
        self.handlers.replace_all(&cleaned, "").into_owned()
    }
}

impl ParserProcessor for CleanupHtml {
    fn process_feed(&self, mut feed: ParsedFeed) -> ParsedFeed {
        for article in &mut feed.articles {
            article.description = self.clean(&article.description);
        }
        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_scripts_and_styles() {
        let cleanup = CleanupHtml::new().unwrap();
        let html = "<p>a</p><script type=\"text/javascript\">alert(1)</script>\
                    <STYLE>p{}</STYLE><iframe src=\"x\"></iframe><p>b</p>";
        assert_eq!(cleanup.clean(html), "<p>a</p><p>b</p>");
    }

    #[test]
    fn test_strips_event_handlers() {
        let cleanup = CleanupHtml::new().unwrap();
        let html = r#"<img src="a.png" onerror="steal()" onload='x()'>"#;
        assert_eq!(cleanup.clean(html), r#"<img src="a.png">"#);
    }

    #[test]
    fn test_keeps_plain_markup() {
        let cleanup = CleanupHtml::new().unwrap();
        let html = r#"<p class="one">Nothing to see</p>"#;
        assert_eq!(cleanup.clean(html), html);
    }
}
