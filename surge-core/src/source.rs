use std::str::FromStr;

/// Where a test target came from, for display purposes.
pub const CMDLINE_SENTINEL: &str = "[cmdline]";
pub const STDIN_SENTINEL: &str = "[stdin]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    Url,
    Script,
}

/// Requested input type; `Auto` triggers the URL-vs-script heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Auto,
    Url,
    Script,
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "url" => Ok(Self::Url),
            "script" => Ok(Self::Script),
            other => Err(format!(
                "invalid input type `{other}` (expected auto, url or script)"
            )),
        }
    }
}

/// Resolved test input. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    pub data: Vec<u8>,
    pub filename: String,
    pub kind: SourceKind,
}

impl SourceData {
    pub fn data_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// True when the bytes parse as a URL with a non-empty scheme.
pub fn looks_like_url(data: &[u8]) -> bool {
    let Ok(s) = std::str::from_utf8(data) else {
        return false;
    };
    url::Url::parse(s.trim()).is_ok()
}
