//! Rewrites storefront URLs so that the browser fetches through the dev server.

use percent_encoding::percent_decode_str;
use regex::{Captures, Regex};

/// Store CDN paths, served by the store's own domain.
pub const VANITY_CDN_PREFIX: &str = "/cdn/";

/// Theme app extension assets, served by the main CDN.
pub const EXTENSION_CDN_PREFIX: &str = "/ext/cdn/";

pub const SESSION_COOKIE_NAME: &str = "_shopify_essential";

/// Rewrite rules for one store.
#[derive(Debug, Clone)]
pub struct CdnRewriter {
    vanity_cdn: Regex,
    main_cdn: Regex,
    base_url_attribute: Regex,
    cookie_domain: Regex,
    session_cookie: Regex,
}

impl CdnRewriter {
    pub fn new(store_fqdn: &str) -> Result<Self, regex::Error> {
        let store = regex::escape(store_fqdn);

        Ok(Self {
            vanity_cdn: Regex::new(&format!("(?:https?:)?//{store}{VANITY_CDN_PREFIX}"))?,
            main_cdn: Regex::new(r#"(?:https?:)?//cdn\.shopify\.com/(.*?/(assets/[^?#"'`>\s]+))"#)?,
            base_url_attribute: Regex::new(&format!(
                r#"data-base-url=["']((?:https?:)?//{store})[^"']*?["']"#
            ))?,
            cookie_domain: Regex::new(&format!(r"(?i)Domain={store};\s*"))?,
            session_cookie: Regex::new(&format!("{SESSION_COOKIE_NAME}=([^;]*)(?:;|$)"))?,
        })
    }

    /// Points store CDN URLs at the dev server, and main CDN URLs too when
    /// they name an asset `is_local` knows about. Images stay on the CDN
    /// since they may rely on its resizing filters.
    pub fn rewrite<F>(&self, content: &str, is_local: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let content = self.vanity_cdn.replace_all(content, VANITY_CDN_PREFIX);

        self.main_cdn
            .replace_all(&content, |caps: &Captures| {
                let matched = &caps[0];
                let pathname = &caps[1];
                let asset = &caps[2];

                if is_image(asset) {
                    return matched.to_owned();
                }

                if pathname.starts_with("extensions/") && is_local(asset) {
                    format!("{EXTENSION_CDN_PREFIX}{pathname}")
                } else if is_local(asset) {
                    format!("{VANITY_CDN_PREFIX}{pathname}")
                } else {
                    matched.to_owned()
                }
            })
            .into_owned()
    }

    /// Rewrites `data-base-url` attributes naming the store to `local_origin`.
    pub fn patch_base_urls(&self, html: &str, local_origin: &str) -> String {
        self.base_url_attribute
            .replace_all(html, |caps: &Captures| {
                caps[0].replacen(&caps[1], local_origin, 1)
            })
            .into_owned()
    }

    /// Drops the store domain from a `Set-Cookie` value; it is invalid for
    /// localhost.
    pub fn strip_cookie_domain(&self, set_cookie: &str) -> String {
        self.cookie_domain.replace_all(set_cookie, "").into_owned()
    }

    /// The session cookie value a `Set-Cookie` header carries, if any.
    pub fn session_cookie(&self, set_cookie: &str) -> Option<String> {
        self.session_cookie
            .captures(set_cookie)
            .map(|caps| caps[1].to_owned())
            .filter(|value| !value.is_empty())
    }
}

fn is_image(path: &str) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
}

/// Theme asset key addressed by a dev server path, e.g.
/// `/cdn/shop/t/4/assets/base.css?v=1` becomes `assets/base.css`.
pub fn local_asset_key(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    if !(path.starts_with(VANITY_CDN_PREFIX) || path.starts_with("/assets/")) {
        return None;
    }

    let (_, file) = path.rsplit_once("/assets/")?;
    if file.is_empty() || file.contains('/') {
        return None;
    }

    let file = percent_decode_str(file).decode_utf8().ok()?;
    if file.contains('/') {
        return None;
    }
    Some(format!("assets/{file}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STORE: &str = "my-shop.myshopify.com";

    fn rewriter() -> CdnRewriter {
        CdnRewriter::new(STORE).unwrap()
    }

    fn local(asset: &str) -> bool {
        matches!(asset, "assets/base.css" | "assets/logo.png" | "assets/app.js")
    }

    #[test]
    fn vanity_cdn_urls_go_through_the_dev_server() {
        let html = r#"<link href="//my-shop.myshopify.com/cdn/shop/t/4/assets/base.css?v=1">
<script src="https://my-shop.myshopify.com/cdn/shopifycloud/x.js"></script>"#;

        assert_eq!(
            rewriter().rewrite(html, local),
            r#"<link href="/cdn/shop/t/4/assets/base.css?v=1">
<script src="/cdn/shopifycloud/x.js"></script>"#
        );
    }

    #[test]
    fn main_cdn_urls_are_rewritten_only_for_local_non_images() {
        let html = concat!(
            r#"<link href="https://cdn.shopify.com/s/files/1/0/t/4/assets/base.css?v=9">"#,
            r#"<img src="//cdn.shopify.com/s/files/1/0/t/4/assets/logo.png">"#,
            r#"<script src="//cdn.shopify.com/s/files/1/0/t/4/assets/vendor.js"></script>"#,
            r#"<script src="//cdn.shopify.com/extensions/abc/assets/app.js"></script>"#,
        );

        assert_eq!(
            rewriter().rewrite(html, local),
            concat!(
                r#"<link href="/cdn/s/files/1/0/t/4/assets/base.css?v=9">"#,
                r#"<img src="//cdn.shopify.com/s/files/1/0/t/4/assets/logo.png">"#,
                r#"<script src="//cdn.shopify.com/s/files/1/0/t/4/assets/vendor.js"></script>"#,
                r#"<script src="/ext/cdn/extensions/abc/assets/app.js"></script>"#,
            )
        );
    }

    #[test]
    fn rewriting_is_idempotent() {
        let html = r#"<link href="https://cdn.shopify.com/s/files/1/t/4/assets/base.css">"#;
        let once = rewriter().rewrite(html, local);
        assert_eq!(rewriter().rewrite(&once, local), once);
    }

    #[test]
    fn base_url_attributes_point_at_local_origin() {
        let html = r#"<form data-base-url="https://my-shop.myshopify.com/cart" data-other="x">"#;
        assert_eq!(
            rewriter().patch_base_urls(html, "http://127.0.0.1:9292"),
            r#"<form data-base-url="http://127.0.0.1:9292/cart" data-other="x">"#
        );
    }

    #[test]
    fn cookies_lose_store_domain() {
        let cookie = "_shopify_essential=abc123; Domain=my-shop.myshopify.com; Path=/; HttpOnly";
        assert_eq!(
            rewriter().strip_cookie_domain(cookie),
            "_shopify_essential=abc123; Path=/; HttpOnly"
        );
        assert_eq!(rewriter().session_cookie(cookie).as_deref(), Some("abc123"));
        assert_eq!(rewriter().session_cookie("cart=1; Path=/"), None);
    }

    #[test]
    fn asset_paths_map_to_keys() {
        assert_eq!(
            local_asset_key("/cdn/shop/t/4/assets/base.css?v=123").as_deref(),
            Some("assets/base.css")
        );
        assert_eq!(
            local_asset_key("/assets/my%20font.woff2").as_deref(),
            Some("assets/my font.woff2")
        );
        assert_eq!(
            local_asset_key("/assets/a+b=c&d.css").as_deref(),
            Some("assets/a+b=c&d.css")
        );
        assert_eq!(local_asset_key("/assets/bad%FF.css"), None);
        assert_eq!(local_asset_key("/assets/..%2Fconfig.yml"), None);
        assert_eq!(local_asset_key("/products/shirt"), None);
        assert_eq!(local_asset_key("/cdn/shop/t/4/assets/"), None);
    }
}
