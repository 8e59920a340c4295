//! Dispatch targets for tool invocation and tool search.
//!
//! The bridge never talks to the tool catalog directly; every call goes
//! through a [`ToolDispatcher`], chosen once at engine construction. The
//! embedding host either implements the trait in-process or uses the
//! provided [`HttpDispatcher`] against two fixed internal endpoints.

use kiln_error::DispatchError;
use serde_json::Value;
use url::Url;

/// How much of each matching tool the search shim should return.
///
/// Unrecognized values parse to [`DetailLevel::NameAndDescription`] rather
/// than erroring; scripts probing with arbitrary strings still get a usable
/// answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailLevel {
    /// Tool name and one-line description (the default).
    #[default]
    NameAndDescription,
    /// Full schema including parameter definitions.
    FullSchema,
}

impl DetailLevel {
    /// Permissive parse: anything unrecognized falls back to the default.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "full-schema" | "full" | "schema" => Self::FullSchema,
            _ => Self::NameAndDescription,
        }
    }

    /// Wire name of this detail level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameAndDescription => "name-and-description",
            Self::FullSchema => "full-schema",
        }
    }
}

/// Trait for dispatching tool calls and tool searches from the sandbox.
///
/// Implementations hold whatever credentials and connections the catalog
/// needs; sandbox code never sees any of that — it only observes the JSON
/// result value or a raised error.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Invoke a tool by its unique name with decoded JSON arguments.
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError>;

    /// Search the tool catalog with a free-text query.
    async fn search_tools(&self, query: &str, detail: DetailLevel)
        -> Result<Value, DispatchError>;
}

/// Dispatch target that forwards calls to two fixed HTTP endpoints.
///
/// Both endpoints accept `POST` with a JSON body and return JSON. The
/// endpoints are fixed for the life of the engine; there is no per-call
/// routing.
pub struct HttpDispatcher {
    invoke_url: Url,
    search_url: Url,
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Create a dispatcher for the given invoke and search endpoints.
    pub fn new(invoke_url: Url, search_url: Url) -> Self {
        Self {
            invoke_url,
            search_url,
            client: reqwest::Client::new(),
        }
    }

    /// Build a dispatcher from loaded settings.
    pub fn from_settings(settings: &kiln_config::DispatchConfig) -> Result<Self, url::ParseError> {
        Ok(Self::new(
            Url::parse(&settings.invoke_url)?,
            Url::parse(&settings.search_url)?,
        ))
    }

    async fn post_json(&self, url: &Url, body: Value, label: &str) -> Result<Value, DispatchError> {
        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Upstream {
                tool: label.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), message.trim()),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DispatchError::Transport(format!("invalid JSON from endpoint: {e}")))
    }
}

#[async_trait::async_trait]
impl ToolDispatcher for HttpDispatcher {
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError> {
        tracing::debug!(tool = %tool, "dispatching tool call over HTTP");
        let body = serde_json::json!({ "tool": tool, "arguments": args });
        self.post_json(&self.invoke_url, body, tool).await
    }

    async fn search_tools(
        &self,
        query: &str,
        detail: DetailLevel,
    ) -> Result<Value, DispatchError> {
        tracing::debug!(query = %query, detail = detail.as_str(), "dispatching tool search over HTTP");
        let body = serde_json::json!({ "query": query, "detail": detail.as_str() });
        self.post_json(&self.search_url, body, "searchTools").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_level_parses_known_values() {
        assert_eq!(
            DetailLevel::parse("name-and-description"),
            DetailLevel::NameAndDescription
        );
        assert_eq!(DetailLevel::parse("full-schema"), DetailLevel::FullSchema);
        assert_eq!(DetailLevel::parse("full"), DetailLevel::FullSchema);
    }

    #[test]
    fn detail_level_defaults_unknown_values() {
        // Junk falls back to the default instead of raising
        assert_eq!(DetailLevel::parse(""), DetailLevel::NameAndDescription);
        assert_eq!(DetailLevel::parse("bogus"), DetailLevel::NameAndDescription);
        assert_eq!(
            DetailLevel::parse("FULL-SCHEMA-PLEASE"),
            DetailLevel::NameAndDescription
        );
    }

    #[test]
    fn http_dispatcher_builds_from_settings() {
        let settings = kiln_config::DispatchConfig {
            invoke_url: "http://127.0.0.1:7311/internal/tools/invoke".into(),
            search_url: "http://127.0.0.1:7311/internal/tools/search".into(),
        };
        assert!(HttpDispatcher::from_settings(&settings).is_ok());

        let bad = kiln_config::DispatchConfig {
            invoke_url: "not a url".into(),
            search_url: "http://127.0.0.1:7311/internal/tools/search".into(),
        };
        assert!(HttpDispatcher::from_settings(&bad).is_err());
    }

    #[test]
    fn detail_level_round_trips_wire_names() {
        for level in [DetailLevel::NameAndDescription, DetailLevel::FullSchema] {
            assert_eq!(DetailLevel::parse(level.as_str()), level);
        }
    }
}
