//! Query descriptors: what to fetch from a remote collection, and how hard to try.
//!
//! A descriptor is immutable once built. Its [`cache_key`](QueryDescriptor::cache_key)
//! only covers the fields that shape the result set, so the same logical query
//! issued with a different deadline still hits the same cache entry.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use steadfast::query::{Direction, FilterOp, QueryDescriptor};
//!
//! let query = QueryDescriptor::new("repairs")
//!   .select(["id", "status", "total_cost"])
//!   .filter("status", FilterOp::Eq, "open")
//!   .order_by("created_at", Direction::Desc)
//!   .page(0, 50)
//!   .with_deadline(Duration::from_secs(5));
//!
//! assert_eq!(query.cache_key().len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DataError, DataResult};

/// Comparison applied by a single filter term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
  /// Case-sensitive pattern match (`%` wildcard)
  Like,
  /// Case-insensitive pattern match (`%` wildcard)
  Ilike,
}

impl FilterOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      FilterOp::Eq => "eq",
      FilterOp::Neq => "neq",
      FilterOp::Gt => "gt",
      FilterOp::Gte => "gte",
      FilterOp::Lt => "lt",
      FilterOp::Lte => "lte",
      FilterOp::Like => "like",
      FilterOp::Ilike => "ilike",
    }
  }
}

impl FromStr for FilterOp {
  type Err = DataError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "eq" => Ok(FilterOp::Eq),
      "neq" => Ok(FilterOp::Neq),
      "gt" => Ok(FilterOp::Gt),
      "gte" => Ok(FilterOp::Gte),
      "lt" => Ok(FilterOp::Lt),
      "lte" => Ok(FilterOp::Lte),
      "like" => Ok(FilterOp::Like),
      "ilike" => Ok(FilterOp::Ilike),
      other => Err(DataError::InvalidDescriptor(format!(
        "unknown filter operator '{}'",
        other
      ))),
    }
  }
}

/// One term of the filter conjunction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: String,
}

impl fmt::Display for Filter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", self.field, self.op.as_str(), self.value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Asc,
  Desc,
}

impl Direction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Direction::Asc => "asc",
      Direction::Desc => "desc",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ordering {
  pub field: String,
  pub direction: Direction,
}

/// Result range: `limit` rows starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
  pub offset: u64,
  pub limit: u64,
}

/// Description of a logical remote query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
  pub collection: String,
  /// Selected fields; empty means all fields
  pub fields: Vec<String>,
  pub filters: Vec<Filter>,
  pub order: Option<Ordering>,
  pub page: Option<Page>,
  /// Per-attempt deadline; falls back to the executor's configured default
  pub deadline: Option<Duration>,
  /// Additional attempts after the first; falls back to the configured default
  pub max_retries: Option<u32>,
}

impl QueryDescriptor {
  pub fn new(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      fields: Vec::new(),
      filters: Vec::new(),
      order: None,
      page: None,
      deadline: None,
      max_retries: None,
    }
  }

  pub fn select<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields = fields.into_iter().map(Into::into).collect();
    self
  }

  pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
    self.order = Some(Ordering {
      field: field.into(),
      direction,
    });
    self
  }

  pub fn page(mut self, offset: u64, limit: u64) -> Self {
    self.page = Some(Page { offset, limit });
    self
  }

  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  /// Check the input constraints the executor relies on.
  pub fn validate(&self) -> DataResult<()> {
    if self.collection.trim().is_empty() {
      return Err(DataError::InvalidDescriptor(
        "collection name is empty".to_string(),
      ));
    }
    if self.deadline == Some(Duration::ZERO) {
      return Err(DataError::InvalidDescriptor(
        "deadline must be greater than zero".to_string(),
      ));
    }
    if let Some(page) = self.page {
      if page.limit == 0 {
        return Err(DataError::InvalidDescriptor(
          "page limit must be greater than zero".to_string(),
        ));
      }
    }
    Ok(())
  }

  /// Canonical encoding of the result-shaping fields.
  ///
  /// Field and filter order are normalized: the filter is a conjunction and
  /// selection order does not change which rows come back. Every component is
  /// a separate JSON value, so no filter value can pass for a second term.
  fn canonical(&self) -> Vec<u8> {
    let mut fields: Vec<&str> = self.fields.iter().map(|f| f.trim()).collect();
    fields.sort_unstable();
    fields.dedup();

    let mut filters: Vec<(&str, &str, &str)> = self
      .filters
      .iter()
      .map(|f| (f.field.as_str(), f.op.as_str(), f.value.as_str()))
      .collect();
    filters.sort_unstable();

    let order = self
      .order
      .as_ref()
      .map(|o| (o.field.as_str(), o.direction.as_str()));
    let page = self.page.map(|p| (p.offset, p.limit));

    serde_json::json!([self.collection.trim(), fields, filters, order, page])
      .to_string()
      .into_bytes()
  }

  /// Stable, fixed-length cache key (hex SHA-256 of the canonical form).
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical());
    hex::encode(hasher.finalize())
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    let mut out = self.collection.clone();
    if !self.filters.is_empty() {
      let terms: Vec<String> = self.filters.iter().map(|f| f.to_string()).collect();
      out.push_str(&format!(" where {}", terms.join(" and ")));
    }
    if let Some(o) = &self.order {
      out.push_str(&format!(" order by {} {}", o.field, o.direction.as_str()));
    }
    if let Some(p) = self.page {
      out.push_str(&format!(" [{}..{}]", p.offset, p.offset.saturating_add(p.limit)));
    }
    out
  }
}
