// ========================================================================================
//
//                                 Assisted Name Resolution
//
// ========================================================================================
//
// The last resort for aliases that no rule tier could place confidently. A batch of
// aliases and a shortlist of catalog ids is handed to an external resolver (a hosted
// language model behind a small JSON endpoint). The resolver is optional: without it
// the name resolver keeps its best rule-based guesses.

use crate::types::AliasRequest;
use log::debug;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const ASSIST_USER_AGENT: &str = "proxima-assist/0.1";

const INSTRUCTIONS: &str = "Map each alias to the single catalog identifier that names the \
same ancient or modern population. Only answer with identifiers from the candidate list. \
Report a confidence between 0 and 1 and a one-sentence rationale.";

#[derive(Error, Debug)]
pub enum AssistError {
    #[error("Assisted resolver request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("Assisted resolver returned an unreadable reply: {0}")]
    Decode(String),
    #[error("Assisted resolver unavailable: {0}")]
    Unavailable(String),
}

/// One answer from the assisted resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistedMatch {
    pub alias: String,
    pub resolved_id: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// An external service that maps a batch of aliases onto catalog ids. Answers for
/// aliases it cannot place may simply be omitted.
pub trait AssistedResolver: Send + Sync {
    fn resolve_batch(
        &self,
        aliases: &[AliasRequest],
        candidates: &[String],
    ) -> Result<Vec<AssistedMatch>, AssistError>;
}

#[derive(Serialize)]
struct AssistRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    instructions: &'a str,
    aliases: &'a [AliasRequest],
    candidates: &'a [String],
}

#[derive(Deserialize)]
struct AssistReply {
    matches: Vec<AssistedMatch>,
}

/// JSON-over-HTTP adapter. The bearer key is read from an environment variable at
/// construction time and never written to logs.
pub struct HttpAssistedResolver {
    endpoint: Url,
    client: Client,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpAssistedResolver {
    pub fn new(
        endpoint: &str,
        api_key_env: &str,
        model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AssistError> {
        let endpoint = Url::parse(endpoint).map_err(|e| AssistError::Http {
            url: endpoint.to_string(),
            message: format!("invalid URL: {e}"),
        })?;
        let client = Client::builder()
            .user_agent(ASSIST_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AssistError::Unavailable(e.to_string()))?;
        let api_key = std::env::var(api_key_env).ok().filter(|key| !key.is_empty());
        if api_key.is_none() {
            debug!("{api_key_env} is not set; assisted requests are sent without a bearer key");
        }
        Ok(Self {
            endpoint,
            client,
            api_key,
            model,
        })
    }
}

impl fmt::Debug for HttpAssistedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAssistedResolver")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl AssistedResolver for HttpAssistedResolver {
    fn resolve_batch(
        &self,
        aliases: &[AliasRequest],
        candidates: &[String],
    ) -> Result<Vec<AssistedMatch>, AssistError> {
        let http_error = |message: String| AssistError::Http {
            url: self.endpoint.to_string(),
            message,
        };
        let body = AssistRequest {
            model: self.model.as_deref(),
            instructions: INSTRUCTIONS,
            aliases,
            candidates,
        };
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|e| http_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(http_error(format!("status {}", response.status())));
        }
        let text = response.text().map_err(|e| http_error(e.to_string()))?;
        let matches = parse_reply(&text)?;
        debug!(
            "Assisted resolver answered {} of {} alias(es)",
            matches.len(),
            aliases.len()
        );
        Ok(matches)
    }
}

/// Parses a reply body of the form `{"matches": [...]}`.
pub fn parse_reply(body: &str) -> Result<Vec<AssistedMatch>, AssistError> {
    serde_json::from_str::<AssistReply>(body)
        .map(|reply| reply.matches)
        .map_err(|e| AssistError::Decode(e.to_string()))
}
