use crate::agents::discovery::MetadataSource;
use crate::provider::{ProviderClient, ProviderError, ProviderRequest, ProviderResponse};
use async_trait::async_trait;
use paperflow_core::config::{
    MetadataSourceConfig, MetadataSourceKind, ProviderApi, ProviderConfig,
};
use paperflow_core::{AgentError, PaperflowError, PaperflowResult, ProviderId, TokenUsage};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Provider client speaking the OpenAI chat-completions or Anthropic messages API.
pub struct HttpProviderClient {
    id: ProviderId,
    api: ProviderApi,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpProviderClient {
    /// A client for one provider; `base_url` loses any trailing slash.
    pub fn new(
        id: impl Into<ProviderId>,
        api: ProviderApi,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    /// Build from configuration, reading the API key from `api_key_env`.
    pub fn from_config(config: &ProviderConfig) -> PaperflowResult<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                PaperflowError::Config(format!(
                    "provider '{}' expects an API key in ${var}",
                    config.id
                ))
            })?),
            None => None,
        };
        Ok(Self::new(
            config.id.clone(),
            config.api,
            config.base_url(),
            api_key,
        ))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    async fn complete_openai(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            messages.push(json!({"role": m.role.as_str(), "content": m.content}));
        }
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens,
            "messages": messages,
        });

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = self.send(builder).await?;
        parse_openai_response(&resp, &request.model)
    }

    async fn complete_anthropic(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let mut builder = self
            .http
            .post(&url)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        let resp = self.send(builder).await?;
        parse_anthropic_response(&resp, &request.model)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn provider(&self) -> &ProviderId {
        &self.id
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        debug!(provider = %self.id, model = %request.model, "Provider call");
        match self.api {
            ProviderApi::OpenAi => self.complete_openai(&request).await,
            ProviderApi::Anthropic => self.complete_anthropic(&request).await,
        }
    }
}

fn token_count(value: &Value) -> u64 {
    value.as_u64().unwrap_or(0)
}

/// Parse an OpenAI-compatible chat-completions body.
pub fn parse_openai_response(
    body: &Value,
    requested_model: &str,
) -> Result<ProviderResponse, ProviderError> {
    let output = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?
        .to_string();
    Ok(ProviderResponse {
        output,
        usage: TokenUsage::new(
            token_count(&body["usage"]["prompt_tokens"]),
            token_count(&body["usage"]["completion_tokens"]),
        ),
        model: body["model"].as_str().unwrap_or(requested_model).to_string(),
    })
}

/// Parse an Anthropic messages body, joining its text blocks.
pub fn parse_anthropic_response(
    body: &Value,
    requested_model: &str,
) -> Result<ProviderResponse, ProviderError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("missing content".into()))?;
    let text: Vec<&str> = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect();
    Ok(ProviderResponse {
        output: text.join("\n"),
        usage: TokenUsage::new(
            token_count(&body["usage"]["input_tokens"]),
            token_count(&body["usage"]["output_tokens"]),
        ),
        model: body["model"].as_str().unwrap_or(requested_model).to_string(),
    })
}

/// Metadata lookups against the Crossref or Semantic Scholar REST APIs.
pub struct HttpMetadataSource {
    kind: MetadataSourceKind,
    provider: ProviderId,
    base_url: String,
    http: reqwest::Client,
}

impl HttpMetadataSource {
    /// A source of `kind` rooted at `base_url`.
    pub fn new(kind: MetadataSourceKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            provider: kind.provider_id(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// A source built from its `[[metadata_sources]]` entry.
    pub fn from_config(config: &MetadataSourceConfig) -> Self {
        Self::new(config.id, config.base_url())
    }

    /// Which upstream API this source speaks.
    pub fn kind(&self) -> MetadataSourceKind {
        self.kind
    }

    fn lookup_url(&self, paper_id: &str) -> String {
        match self.kind {
            MetadataSourceKind::Crossref => format!("{}/works/{}", self.base_url, paper_id),
            MetadataSourceKind::SemanticScholar => {
                let id = if paper_id.starts_with("10.") {
                    format!("DOI:{paper_id}")
                } else {
                    paper_id.to_string()
                };
                format!(
                    "{}/graph/v1/paper/{}?fields=title,authors,year,venue,abstract,externalIds",
                    self.base_url, id
                )
            }
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    async fn lookup(&self, paper_id: &str) -> Result<Value, AgentError> {
        let url = self.lookup_url(paper_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ProviderError::from)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::permanent(format!(
                "{} has no record for '{paper_id}'",
                self.provider
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body).into());
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| AgentError::permanent(format!("malformed metadata response: {e}")))?;
        Ok(match self.kind {
            MetadataSourceKind::Crossref => normalize_crossref(&body),
            MetadataSourceKind::SemanticScholar => normalize_semantic_scholar(&body),
        })
    }
}

fn put(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(v) = value.filter(|v| !v.is_null()) {
        map.insert(key.to_string(), v);
    }
}

fn first_str(value: &Value) -> Option<Value> {
    value[0].as_str().map(|s| json!(s))
}

/// Reduce a Crossref `/works` body to the common metadata shape.
pub fn normalize_crossref(body: &Value) -> Value {
    let msg = &body["message"];
    let mut out = Map::new();
    put(&mut out, "title", first_str(&msg["title"]));
    let authors: Vec<String> = msg["author"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    let given = a["given"].as_str().unwrap_or_default();
                    let family = a["family"].as_str()?;
                    Some(format!("{given} {family}").trim().to_string())
                })
                .collect()
        })
        .unwrap_or_default();
    if !authors.is_empty() {
        out.insert("authors".into(), json!(authors));
    }
    put(
        &mut out,
        "year",
        msg["issued"]["date-parts"][0][0].as_i64().map(|y| json!(y)),
    );
    put(&mut out, "venue", first_str(&msg["container-title"]));
    put(&mut out, "doi", msg["DOI"].as_str().map(|s| json!(s)));
    put(&mut out, "abstract", msg["abstract"].as_str().map(|s| json!(s)));
    Value::Object(out)
}

/// Reduce a Semantic Scholar paper body to the common metadata shape.
pub fn normalize_semantic_scholar(body: &Value) -> Value {
    let mut out = Map::new();
    put(&mut out, "title", body["title"].as_str().map(|s| json!(s)));
    let authors: Vec<&str> = body["authors"]
        .as_array()
        .map(|list| list.iter().filter_map(|a| a["name"].as_str()).collect())
        .unwrap_or_default();
    if !authors.is_empty() {
        out.insert("authors".into(), json!(authors));
    }
    put(&mut out, "year", body["year"].as_i64().map(|y| json!(y)));
    put(
        &mut out,
        "venue",
        body["venue"]
            .as_str()
            .filter(|v| !v.is_empty())
            .map(|s| json!(s)),
    );
    put(
        &mut out,
        "doi",
        body["externalIds"]["DOI"].as_str().map(|s| json!(s)),
    );
    put(&mut out, "abstract", body["abstract"].as_str().map(|s| json!(s)));
    Value::Object(out)
}
