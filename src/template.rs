//! Default template processor.
//!
//! Rewrites an HTML document into a template where every collected asset is
//! replaced by a placeholder comment, and returns the ordered asset lists.
//! This is plain string matching, not an HTML parser: tags are recognised by
//! the same patterns a browser-side loader would use.

use crate::asset::{inline_code, AssetReference};
use crate::error::Error;
use fancy_regex::{Captures, Regex};
use std::sync::LazyLock;
use url::Url;

const MARK: &str = "html-entry";

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("invalid template pattern"));
    };
}

regex!(ALL_SCRIPT, r"(?i)(<script[\s\S]*?>)[\s\S]*?</script>");
regex!(
    SCRIPT_TAG,
    r#"(?is)<(script)\s+((?!type=('|")text/ng-template\3).)*?>.*?</\1>"#
);
regex!(SCRIPT_SRC, r#".*\ssrc=('|")?([^>'"\s]+)"#);
regex!(SCRIPT_TYPE, r#".*\stype=('|")?([^>'"\s]+)"#);
regex!(SCRIPT_ENTRY, r".*\sentry\s*.*");
regex!(SCRIPT_ASYNC, r".*\sasync\s*.*");
regex!(SCRIPT_MODULE, r#".*\stype=('|")?module('|")?\s*.*"#);
regex!(LINK_TAG, r"(?is)<(link)\s+.*?>");
regex!(LINK_PRELOAD_OR_PREFETCH, r#"\srel=(['"]?)(preload|prefetch)\1"#);
regex!(LINK_HREF, r#".*\shref=('|")?([^>'"\s]+)"#);
regex!(LINK_AS_FONT, r#".*\sas=(['"]?)font\1.*"#);
regex!(STYLE_TAG, r"(?i)<style[^>]*>[\s\S]*?</style>");
regex!(STYLE_TYPE, r#"\s+rel=(['"]?)stylesheet\1.*"#);
regex!(HTML_COMMENT, r"<!--([\s\S]*?)-->");
regex!(LINK_IGNORE, r"(?is)<link(\s+|\s+.+\s+)ignore(\s*|\s+.*|=.*)>");
regex!(STYLE_IGNORE, r"(?is)<style(\s+|\s+.+\s+)ignore(\s*|\s+.*|=.*)>");
regex!(SCRIPT_IGNORE, r"(?is)<script(\s+|\s+.+\s+)ignore(\s*|\s+.*|=.*)>");
regex!(
    PLACEHOLDER,
    r"(?s)<!-- .*? (?:replaced|ignored) by html-entry -->"
);

const JAVASCRIPT_TYPES: &[&str] = &[
    "text/javascript",
    "module",
    "application/javascript",
    "text/ecmascript",
    "application/ecmascript",
];

/// Result of processing a template: the rewritten template and its assets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub template: String,
    pub scripts: Vec<AssetReference>,
    pub styles: Vec<AssetReference>,
    /// The bootstrap script; the last script when none is marked `entry`.
    pub entry: Option<AssetReference>,
}

/// A placeholder token found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Script { src: String, is_async: bool },
    Link { href: String, preload: bool },
    InlineScript,
    Ignored { src: String },
    ModuleScript { src: String },
}

pub fn script_placeholder(src: &str, is_async: bool) -> String {
    if is_async {
        format!("<!-- async script {} replaced by {} -->", src, MARK)
    } else {
        format!("<!-- script {} replaced by {} -->", src, MARK)
    }
}

pub fn link_placeholder(href: &str, preload_or_prefetch: bool) -> String {
    if preload_or_prefetch {
        format!("<!-- prefetch/preload link {} replaced by {} -->", href, MARK)
    } else {
        format!("<!-- link {} replaced by {} -->", href, MARK)
    }
}

pub fn inline_script_placeholder() -> String {
    format!("<!-- inline scripts replaced by {} -->", MARK)
}

pub fn ignored_asset_placeholder(src: &str) -> String {
    let src = if src.is_empty() { "file" } else { src };
    format!("<!-- ignore asset {} replaced by {} -->", src, MARK)
}

/// Module scripts are skipped: the runtime evaluates classic scripts only.
pub fn module_script_placeholder(src: &str) -> String {
    format!("<!-- module script {} ignored by {} -->", src, MARK)
}

/// Parse a single placeholder token back into what it stands for.
pub fn parse_placeholder(token: &str) -> Option<Placeholder> {
    let body = token.strip_prefix("<!-- ")?;
    if let Some(rest) = body.strip_suffix(&format!(" ignored by {} -->", MARK)) {
        let src = rest.strip_prefix("module script ")?;
        return Some(Placeholder::ModuleScript { src: src.to_string() });
    }
    let rest = body.strip_suffix(&format!(" replaced by {} -->", MARK))?;

    if rest == "inline scripts" {
        Some(Placeholder::InlineScript)
    } else if let Some(src) = rest.strip_prefix("async script ") {
        Some(Placeholder::Script {
            src: src.to_string(),
            is_async: true,
        })
    } else if let Some(src) = rest.strip_prefix("script ") {
        Some(Placeholder::Script {
            src: src.to_string(),
            is_async: false,
        })
    } else if let Some(href) = rest.strip_prefix("prefetch/preload link ") {
        Some(Placeholder::Link {
            href: href.to_string(),
            preload: true,
        })
    } else if let Some(href) = rest.strip_prefix("link ") {
        Some(Placeholder::Link {
            href: href.to_string(),
            preload: false,
        })
    } else {
        rest.strip_prefix("ignore asset ")
            .map(|src| Placeholder::Ignored { src: src.to_string() })
    }
}

/// Every placeholder of `template`, in document order.
pub fn find_placeholders(template: &str) -> Vec<Placeholder> {
    PLACEHOLDER
        .find_iter(template)
        .filter_map(Result::ok)
        .filter_map(|m| parse_placeholder(m.as_str()))
        .collect()
}

/// Public path of an entry URL: its origin plus the directory of its path.
pub fn default_public_path(entry: &str) -> String {
    match Url::parse(entry) {
        Ok(url) => {
            let path = url.path();
            let dir = path.rfind('/').map(|i| &path[..=i]).unwrap_or("/");
            format!("{}{}", url.origin().ascii_serialization(), dir)
        }
        Err(e) => {
            tracing::warn!(entry, error = %e, "cannot derive public path");
            String::new()
        }
    }
}

/// Absolute http(s) URLs are kept verbatim. Protocol-relative ones (`//host/..`)
/// still go through the base so they pick up its scheme.
fn has_protocol(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn entire_path(path: &str, base: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(path))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| path.to_string())
}

fn resolve(path: &str, base: &str) -> String {
    if has_protocol(path) {
        path.to_string()
    } else {
        entire_path(path, base)
    }
}

fn is_match(re: &Regex, text: &str) -> bool {
    re.is_match(text).unwrap_or(false)
}

fn group(re: &Regex, text: &str, index: usize) -> Option<String> {
    re.captures(text)
        .ok()
        .flatten()
        .and_then(|caps| caps.get(index).map(|m| m.as_str().to_string()))
}

fn is_javascript_type(script_type: Option<&str>) -> bool {
    script_type.map_or(true, |t| JAVASCRIPT_TYPES.contains(&t))
}

fn is_pure_comment_block(code: &str) -> bool {
    code.split(['\r', '\n']).all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("//")
    })
}

fn replace_all(re: &Regex, text: &str, rep: impl FnMut(&Captures) -> String) -> Result<String, Error> {
    re.try_replacen(text, 0, rep)
        .map(|out| out.into_owned())
        .map_err(|e| Error::Template(e.to_string()))
}

/// Process an HTML document into a [`Manifest`].
///
/// Relative asset URLs are resolved against `base_url` (the public path).
pub fn process_tpl(tpl: &str, base_url: &str) -> Result<Manifest, Error> {
    let mut scripts = Vec::new();
    let mut styles = Vec::new();
    let mut entry: Option<String> = None;
    let mut failure: Option<Error> = None;

    let template = replace_all(&HTML_COMMENT, tpl, |_| String::new())?;

    let template = replace_all(&LINK_TAG, &template, |caps| {
        let tag = &caps[0];
        if is_match(&STYLE_TYPE, tag) {
            if let Some(href) = group(&LINK_HREF, tag, 2) {
                let href = resolve(&href, base_url);
                if is_match(&LINK_IGNORE, tag) {
                    return ignored_asset_placeholder(&href);
                }
                let placeholder = link_placeholder(&href, false);
                styles.push(AssetReference::Url(href));
                return placeholder;
            }
        }

        if is_match(&LINK_PRELOAD_OR_PREFETCH, tag) && !is_match(&LINK_AS_FONT, tag) {
            if let Some(href) = group(&LINK_HREF, tag, 2) {
                return link_placeholder(&href, true);
            }
        }

        tag.to_string()
    })?;

    let template = replace_all(&STYLE_TAG, &template, |caps| {
        let tag = &caps[0];
        if is_match(&STYLE_IGNORE, tag) {
            ignored_asset_placeholder("style file")
        } else {
            tag.to_string()
        }
    })?;

    let template = replace_all(&ALL_SCRIPT, &template, |caps| {
        let whole = &caps[0];
        let opening = &caps[1];
        let ignored = is_match(&SCRIPT_IGNORE, opening);
        let module = is_match(&SCRIPT_MODULE, opening);
        let script_type = group(&SCRIPT_TYPE, opening, 2);

        if !is_javascript_type(script_type.as_deref()) {
            return whole.to_string();
        }

        if let (true, Some(src)) = (is_match(&SCRIPT_TAG, whole), group(&SCRIPT_SRC, opening, 2)) {
            let src = resolve(&src, base_url);
            if is_match(&SCRIPT_ENTRY, opening) {
                if entry.is_some() {
                    failure.get_or_insert_with(|| {
                        Error::Template("You should not set multiply entry script!".into())
                    });
                } else {
                    entry = Some(src.clone());
                }
            }

            if ignored {
                return ignored_asset_placeholder(&src);
            }
            if module {
                return module_script_placeholder(&src);
            }

            let is_async = is_match(&SCRIPT_ASYNC, opening);
            let placeholder = script_placeholder(&src, is_async);
            scripts.push(if is_async {
                AssetReference::Async { src }
            } else {
                AssetReference::Url(src)
            });
            placeholder
        } else {
            if ignored {
                return ignored_asset_placeholder("js file");
            }
            if module {
                return module_script_placeholder("js file");
            }
            if !is_pure_comment_block(inline_code(whole)) {
                scripts.push(AssetReference::Inline(whole.to_string()));
            }
            inline_script_placeholder()
        }
    })?;

    if let Some(err) = failure {
        return Err(err);
    }

    let entry = match entry {
        Some(src) => Some(
            scripts
                .iter()
                .find(|script| script.src() == src)
                .cloned()
                .unwrap_or(AssetReference::Url(src)),
        ),
        None => scripts.last().cloned(),
    };

    Ok(Manifest {
        template,
        scripts,
        styles,
        entry,
    })
}
