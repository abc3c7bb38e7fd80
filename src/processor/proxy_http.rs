use regex::{Captures, Regex};
use url::form_urlencoded;

use crate::app::{EstuaryError, Result};
use crate::domain::Article;
use crate::processor::ArticleProcessor;

/// Routes plain `http://` image sources through a proxy so that they can be
/// embedded in pages served over https. The template must contain `{url}`,
/// which receives the percent-encoded original address.
pub struct ProxyHttp {
    template: String,
    image_src: Regex,
}

impl ProxyHttp {
    pub fn new(template: &str) -> Result<Self> {
        if !template.contains("{url}") {
            return Err(EstuaryError::Config(format!(
                "proxy template '{}' has no {{url}} placeholder",
                template
            )));
        }

        Ok(Self {
            template: template.to_string(),
            image_src: Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*")(http://[^"]+)""#)?,
        })
    }

    fn proxied(&self, link: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(link.as_bytes()).collect();
        self.template.replace("{url}", &encoded)
    }
}

impl ArticleProcessor for ProxyHttp {
    fn process_articles(&self, mut articles: Vec<Article>) -> Vec<Article> {
        for article in &mut articles {
            let description = self
                .image_src
                .replace_all(&article.description, |caps: &Captures| {
                    format!(r#"{}{}""#, &caps[1], self.proxied(&caps[2]))
                })
                .into_owned();
            article.description = description;
        }
        articles
    }
}
