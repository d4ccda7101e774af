//! Wire types for the dialects the relay speaks. Request bodies keep
//! loosely-typed `serde_json::Value` fields wherever clients are known to
//! send heterogeneous shapes (string-or-array content, object-or-string
//! tool choices); conversion code pattern-matches on the values instead of
//! over-constraining the schema.

pub mod anthropic;
pub mod gemini;
pub mod openai;

/// The client-facing dialect of an inbound request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Facade {
    Anthropic,
    OpenAi,
}

impl Facade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facade::Anthropic => "anthropic",
            Facade::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for Facade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream service dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(ProviderKind::Anthropic),
            "openai" => Some(ProviderKind::OpenAi),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
