use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use url::Url;

use crate::error::{DataError, DataResult};
use crate::query::QueryDescriptor;

use super::{Action, Entity, Mutation, RemoteQuery, RemoteWrite, ResultSet};

/// HTTP client for a PostgREST-style managed backend.
///
/// Collections map to `{base}/{collection}`; filters, ordering and paging are
/// encoded as query parameters (`status=eq.open&order=created_at.desc`).
#[derive(Clone)]
pub struct RestBackend {
  http: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl RestBackend {
  pub fn new(base_url: &str, api_key: Option<String>) -> DataResult<Self> {
    let base = Url::parse(base_url)
      .map_err(|e| DataError::InvalidDescriptor(format!("bad base url '{}': {}", base_url, e)))?;

    let http = reqwest::Client::builder()
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| DataError::Remote(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base,
      api_key,
    })
  }

  fn collection_url(&self, collection: &str) -> DataResult<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| DataError::InvalidDescriptor(format!("base url cannot be a base: {}", self.base)))?
      .pop_if_empty()
      .push(collection);
    Ok(url)
  }

  /// Build the request URL for a query descriptor.
  pub(crate) fn query_url(&self, query: &QueryDescriptor) -> DataResult<Url> {
    let mut url = self.collection_url(&query.collection)?;
    {
      let mut pairs = url.query_pairs_mut();
      if !query.fields.is_empty() {
        pairs.append_pair("select", &query.fields.join(","));
      }
      for f in &query.filters {
        pairs.append_pair(&f.field, &format!("{}.{}", f.op.as_str(), f.value));
      }
      if let Some(order) = &query.order {
        pairs.append_pair(
          "order",
          &format!("{}.{}", order.field, order.direction.as_str()),
        );
      }
      if let Some(page) = query.page {
        pairs.append_pair("offset", &page.offset.to_string());
        pairs.append_pair("limit", &page.limit.to_string());
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self.http.request(method, url);
    match &self.api_key {
      Some(key) => builder
        .header("apikey", key)
        .header("Authorization", format!("Bearer {}", key)),
      None => builder,
    }
  }

  fn id_filter(url: &mut Url, id: &str) {
    url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
  }
}

/// Map a non-success response to the error taxonomy.
async fn check_status(response: Response, what: &str) -> DataResult<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  if status == StatusCode::NOT_FOUND {
    Err(DataError::NotFound(what.to_string()))
  } else {
    Err(DataError::Remote(format!("{} returned {}: {}", what, status, body)))
  }
}

/// Parse the total out of a `Content-Range` header (`0-24/3573`, `*/0`).
pub(crate) fn parse_content_range(value: &str) -> Option<u64> {
  let (_, total) = value.rsplit_once('/')?;
  total.trim().parse().ok()
}

#[async_trait]
impl RemoteQuery for RestBackend {
  async fn fetch(&self, query: &QueryDescriptor) -> DataResult<ResultSet> {
    let url = self.query_url(query)?;

    let response = self
      .request(Method::GET, url)
      .header("Prefer", "count=exact")
      .send()
      .await?;
    let response = check_status(response, &query.collection).await?;

    let total = response
      .headers()
      .get("content-range")
      .and_then(|v| v.to_str().ok())
      .and_then(parse_content_range);

    let body = response.bytes().await?;
    let rows: Vec<Entity> = serde_json::from_slice(&body)?;

    Ok(ResultSet { rows, total })
  }
}

#[async_trait]
impl RemoteWrite for RestBackend {
  async fn apply(&self, mutation: &Mutation) -> DataResult<Entity> {
    let mut url = self.collection_url(&mutation.entity_type)?;

    let method = match mutation.action {
      Action::Create => Method::POST,
      Action::Update => Method::PATCH,
      Action::Delete => Method::DELETE,
    };
    if mutation.action != Action::Create {
      let id = mutation.target_id.as_deref().ok_or_else(|| {
        DataError::InvalidDescriptor(format!("{} without a target id", mutation.action.as_str()))
      })?;
      Self::id_filter(&mut url, id);
    }

    let mut builder = self
      .request(method, url)
      .header("Prefer", "return=representation");
    if mutation.action != Action::Delete {
      builder = builder.json(&mutation.payload);
    }

    let response = builder.send().await?;
    let response = check_status(response, &mutation.entity_type).await?;

    let body = response.bytes().await?;
    let mut rows: Vec<Entity> = serde_json::from_slice(&body)?;

    // PATCH/DELETE on a missing id match zero rows rather than 404
    if rows.is_empty() {
      return Err(DataError::NotFound(format!(
        "{} {}",
        mutation.entity_type,
        mutation.target_id.as_deref().unwrap_or("")
      )));
    }
    Ok(rows.swap_remove(0))
  }
}
