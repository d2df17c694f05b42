//! Asset references as they appear in a manifest.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One script or style of an application.
///
/// Inline code keeps its full tag text (`<script>..</script>`), which is both
/// its identity in the manifest and the marker that it is literal source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawReference", into = "RawReference")]
pub enum AssetReference {
    Url(String),
    Inline(String),
    /// Script fetched when the host is idle and executed whenever it arrives.
    Async { src: String },
}

/// Inline code is recognised by a leading `<`.
pub fn is_inline_code(code: &str) -> bool {
    code.starts_with('<')
}

/// Strip the surrounding tag from inline code: everything between the first
/// `>` and the last `<`.
pub fn inline_code(tag: &str) -> &str {
    let start = tag.find('>').map(|i| i + 1).unwrap_or(0);
    let end = tag.rfind('<').unwrap_or(tag.len());
    if start <= end {
        &tag[start..end]
    } else {
        ""
    }
}

impl AssetReference {
    /// Classify a plain string reference.
    pub fn parse(reference: impl Into<String>) -> Self {
        let reference = reference.into();
        if is_inline_code(&reference) {
            AssetReference::Inline(reference)
        } else {
            AssetReference::Url(reference)
        }
    }

    pub fn async_script(src: impl Into<String>) -> Self {
        AssetReference::Async { src: src.into() }
    }

    /// The URL or tag text identifying this asset.
    pub fn src(&self) -> &str {
        match self {
            AssetReference::Url(src) | AssetReference::Inline(src) => src,
            AssetReference::Async { src } => src,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, AssetReference::Inline(_))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, AssetReference::Async { .. })
    }
}

impl fmt::Display for AssetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.src())
    }
}

impl From<&str> for AssetReference {
    fn from(reference: &str) -> Self {
        AssetReference::parse(reference)
    }
}

impl From<String> for AssetReference {
    fn from(reference: String) -> Self {
        AssetReference::parse(reference)
    }
}

/// Wire shape of a reference: a bare string, or `{ "src": .., "async": true }`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawReference {
    Plain(String),
    Record {
        src: String,
        #[serde(default, rename = "async")]
        is_async: bool,
    },
}

impl From<RawReference> for AssetReference {
    fn from(raw: RawReference) -> Self {
        match raw {
            RawReference::Plain(reference) => AssetReference::parse(reference),
            RawReference::Record { src, is_async: true } => AssetReference::Async { src },
            RawReference::Record { src, is_async: false } => AssetReference::parse(src),
        }
    }
}

impl From<AssetReference> for RawReference {
    fn from(reference: AssetReference) -> Self {
        match reference {
            AssetReference::Url(src) | AssetReference::Inline(src) => RawReference::Plain(src),
            AssetReference::Async { src } => RawReference::Record { src, is_async: true },
        }
    }
}
