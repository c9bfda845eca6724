//! Page content location.
//!
//! The catalog stores one URL per page. Turning it into something a reader
//! can fetch is a pure mapping behind [`AssetResolver`]; the reader tries the
//! candidates in order and uses the first one that answers.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::PageNumber;

/// The only render type the reader understands.
pub const RENDER_TYPE_JSON: &str = "json";

/// Catalog entry for one page of the mushaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAsset {
    pub page_number: PageNumber,
    pub asset_url: String,
    pub render_type: String,
}

impl PageAsset {
    pub fn new(page_number: PageNumber, asset_url: impl Into<String>) -> Self {
        Self {
            page_number,
            asset_url: asset_url.into(),
            render_type: RENDER_TYPE_JSON.to_string(),
        }
    }

    pub fn is_renderable(&self) -> bool {
        self.render_type == RENDER_TYPE_JSON
    }
}

/// Maps a stored URL to an ordered list of candidate fetch URLs.
pub trait AssetResolver: Send + Sync {
    fn resolve(&self, stored_url: &str, page_number: PageNumber) -> Vec<String>;
}

/// Accepts absolute http(s) URLs with a host, `{page}` substituted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectUrlResolver;

impl AssetResolver for DirectUrlResolver {
    fn resolve(&self, stored_url: &str, page_number: PageNumber) -> Vec<String> {
        let substituted = stored_url.replace("{page}", &page_number.to_string());
        match Url::parse(&substituted) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
                vec![url.into()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: i64) -> PageNumber {
        PageNumber::new(n).unwrap()
    }

    #[test]
    fn accepts_http_and_https_only() {
        let r = DirectUrlResolver;
        assert_eq!(
            r.resolve("https://cdn.example.org/p/1.json", page(1)),
            vec!["https://cdn.example.org/p/1.json".to_string()]
        );
        assert_eq!(
            r.resolve("HTTP://Example.org/a", page(1)),
            vec!["http://example.org/a".to_string()]
        );
        assert!(r.resolve("ftp://example.org/a", page(1)).is_empty());
        assert!(r.resolve("/relative/path.json", page(1)).is_empty());
        assert!(r.resolve("https://", page(1)).is_empty());
        assert!(r.resolve("mailto:pages@example.org", page(1)).is_empty());
        assert!(r.resolve("", page(1)).is_empty());
    }

    #[test]
    fn rejects_unparseable_urls() {
        let r = DirectUrlResolver;
        assert!(r.resolve("https://example.org:99999/p.json", page(1)).is_empty());
        assert!(r.resolve("https://[::1/p.json", page(1)).is_empty());
        assert!(r.resolve("http://exa%zzmple/", page(1)).is_empty());
        assert_eq!(
            r.resolve("https://[::1]:8443/p/{page}.json", page(7)),
            vec!["https://[::1]:8443/p/7.json".to_string()]
        );
    }

    #[test]
    fn substitutes_page_placeholder() {
        let r = DirectUrlResolver;
        assert_eq!(
            r.resolve("https://cdn.example.org/mushaf/{page}.json", page(42)),
            vec!["https://cdn.example.org/mushaf/42.json".to_string()]
        );
    }

    #[test]
    fn only_json_is_renderable() {
        let mut asset = PageAsset::new(page(3), "https://example.org/3.json");
        assert!(asset.is_renderable());
        asset.render_type = "svg".to_string();
        assert!(!asset.is_renderable());
    }
}
