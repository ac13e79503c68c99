use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::Transport;
use crate::config::{BackendConfig, Config};
use crate::error::TransportError;
use crate::mutation::{MutationDescriptor, Operation};

const PREFER: &str = "Prefer";
const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=representation";

/// PostgREST-style backend client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  /// `<backend url>/<rest path>/`, always ending in a slash
  rest_base: Url,
  api_key: String,
  schema: Option<String>,
  primary_key: String,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_api_key(
      &config.backend,
      api_key,
      &config.sync.primary_key,
      config.sync.send_timeout(),
    )
  }

  pub fn with_api_key(
    backend: &BackendConfig,
    api_key: String,
    primary_key: &str,
    timeout: std::time::Duration,
  ) -> Result<Self> {
    let mut base = backend.url.trim_end_matches('/').to_string();
    base.push('/');
    base.push_str(backend.rest_path.trim_matches('/'));
    base.push('/');

    let rest_base =
      Url::parse(&base).map_err(|e| eyre!("Invalid backend url {}: {}", backend.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      rest_base,
      api_key,
      schema: backend.schema.clone(),
      primary_key: primary_key.to_string(),
    })
  }

  fn endpoint(&self, mutation: &MutationDescriptor) -> Result<Url, TransportError> {
    let path = match mutation.operation {
      Operation::RemoteCall => format!("rpc/{}", mutation.collection),
      _ => mutation.collection.clone(),
    };
    self
      .rest_base
      .join(&path)
      .map_err(|e| TransportError::validation(format!("Invalid collection {}: {}", path, e)))
  }

  fn row_filter(&self, url: &mut Url, mutation: &MutationDescriptor) -> Result<(), TransportError> {
    let identity = mutation.identity.as_deref().ok_or_else(|| {
      TransportError::validation(format!(
        "{:?} on {} requires `{}` in variables",
        mutation.operation, mutation.collection, self.primary_key
      ))
    })?;
    url
      .query_pairs_mut()
      .append_pair(&self.primary_key, &format!("eq.{}", identity));
    Ok(())
  }

  /// Build the request for a mutation without sending it.
  pub fn request(&self, mutation: &MutationDescriptor) -> Result<RequestBuilder, TransportError> {
    let mut url = self.endpoint(mutation)?;

    let (method, prefer, body) = match mutation.operation {
      Operation::Insert | Operation::BulkInsert => {
        (Method::POST, RETURN_REPRESENTATION, Some(&mutation.variables))
      }
      Operation::Update => {
        self.row_filter(&mut url, mutation)?;
        (Method::PATCH, RETURN_REPRESENTATION, Some(&mutation.variables))
      }
      Operation::Delete => {
        self.row_filter(&mut url, mutation)?;
        (Method::DELETE, RETURN_REPRESENTATION, None)
      }
      Operation::BulkUpdate => {
        url
          .query_pairs_mut()
          .append_pair("on_conflict", &self.primary_key);
        (Method::POST, MERGE_DUPLICATES, Some(&mutation.variables))
      }
      Operation::Upsert => {
        let target = mutation
          .conflict_target
          .as_deref()
          .unwrap_or(&self.primary_key);
        url.query_pairs_mut().append_pair("on_conflict", target);
        (Method::POST, MERGE_DUPLICATES, Some(&mutation.variables))
      }
      Operation::RemoteCall => (Method::POST, "", Some(&mutation.variables)),
    };

    let mut builder = self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key);

    if !prefer.is_empty() {
      builder = builder.header(PREFER, prefer);
    }
    if let Some(schema) = &self.schema {
      builder = builder
        .header("Accept-Profile", schema)
        .header("Content-Profile", schema);
    }
    if let Some(body) = body {
      builder = builder.json(body);
    }
    Ok(builder)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, mutation: &MutationDescriptor) -> Result<Value, TransportError> {
    let response = self
      .request(mutation)?
      .send()
      .await
      .map_err(classify_request_error)?;

    let status = response.status();
    let body = response.text().await.map_err(classify_request_error)?;
    debug!(id = %mutation.id, status = status.as_u16(), "Backend responded");

    if !status.is_success() {
      return Err(classify_status(status, body));
    }
    if body.trim().is_empty() {
      return Ok(Value::Null);
    }

    match serde_json::from_str(&body) {
      Ok(value) => Ok(value),
      Err(e) => {
        // The write went through; an unreadable representation is not a reason to retry.
        warn!(id = %mutation.id, error = %e, "Backend returned a non-JSON body");
        Ok(Value::Null)
      }
    }
  }

  async fn ping(&self) -> Result<(), TransportError> {
    self
      .client
      .get(self.rest_base.clone())
      .header("apikey", &self.api_key)
      .send()
      .await
      .map_err(classify_request_error)?;
    Ok(())
  }
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::timeout(err.to_string())
  } else {
    TransportError::network(err.to_string())
  }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> TransportError {
  let message = if body.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, body)
  };

  match status {
    StatusCode::NOT_FOUND => TransportError::not_found(message),
    StatusCode::CONFLICT => TransportError::conflict(message),
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportError::timeout(message),
    StatusCode::TOO_MANY_REQUESTS => TransportError::network(message),
    s if s.is_server_error() => TransportError::network(message),
    _ => TransportError::validation(message),
  }
}
