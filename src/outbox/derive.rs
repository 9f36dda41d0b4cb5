//! Locally computed fields for queued writes.
//!
//! The remote store derives some columns itself (totals, for instance). A
//! write that never reached it has to carry the same values so the
//! provisional entity looks right until it is synced.

use serde_json::{Number, Value};

use crate::remote::Entity;

/// Computes fields on a payload before it is queued.
pub trait Derivation: Send + Sync {
  fn apply(&self, payload: &mut Entity);
}

impl<F> Derivation for F
where
  F: Fn(&mut Entity) + Send + Sync,
{
  fn apply(&self, payload: &mut Entity) {
    self(payload)
  }
}

/// `total = Σ quantity × unit_price` over a list of line items, plus any
/// flat extra fields, rounded to cents.
#[derive(Debug, Clone)]
pub struct LineItemTotals {
  pub items_field: String,
  pub quantity_field: String,
  pub unit_price_field: String,
  pub total_field: String,
  /// Flat amounts added on top of the item sum
  pub extra_fields: Vec<String>,
}

impl Default for LineItemTotals {
  fn default() -> Self {
    Self {
      items_field: "line_items".to_string(),
      quantity_field: "quantity".to_string(),
      unit_price_field: "unit_price".to_string(),
      total_field: "total_cost".to_string(),
      extra_fields: vec!["labor_cost".to_string()],
    }
  }
}

impl LineItemTotals {
  fn items_sum(&self, items: &[Value]) -> f64 {
    items
      .iter()
      .map(|item| {
        number(item.get(&self.quantity_field)) * number(item.get(&self.unit_price_field))
      })
      .sum()
  }
}

impl Derivation for LineItemTotals {
  fn apply(&self, payload: &mut Entity) {
    let items = payload.get(&self.items_field).and_then(Value::as_array);
    let has_extras = self.extra_fields.iter().any(|f| payload.contains_key(f));
    if items.is_none() && !has_extras {
      return;
    }

    let mut total = items.map(|items| self.items_sum(items)).unwrap_or(0.0);
    for field in &self.extra_fields {
      total += number(payload.get(field));
    }

    let rounded = (total * 100.0).round() / 100.0;
    if let Some(n) = Number::from_f64(rounded) {
      payload.insert(self.total_field.clone(), Value::Number(n));
    }
  }
}

/// Numeric value of a JSON field; numeric strings count, anything else is 0.
fn number(value: Option<&Value>) -> f64 {
  match value {
    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
    Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
    _ => 0.0,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::fake::entity;
  use serde_json::json;

  #[test]
  fn test_line_item_totals() {
    let mut payload = entity(json!({
      "line_items": [
        {"quantity": 2, "unit_price": 10.25},
        {"quantity": 3, "unit_price": "1.10"},
      ],
      "labor_cost": 40,
    }));

    LineItemTotals::default().apply(&mut payload);

    assert_eq!(payload["total_cost"], json!(63.8));
  }

  #[test]
  fn test_rounds_to_cents() {
    let mut payload = entity(json!({
      "line_items": [{"quantity": 3, "unit_price": 0.3333}],
    }));

    LineItemTotals::default().apply(&mut payload);

    assert_eq!(payload["total_cost"], json!(1.0));
  }

  #[test]
  fn test_unrelated_payload_untouched() {
    let mut payload = entity(json!({"status": "closed"}));
    LineItemTotals::default().apply(&mut payload);
    assert!(!payload.contains_key("total_cost"));
  }

  #[test]
  fn test_closure_derivation() {
    let stamp = |p: &mut Entity| {
      p.insert("source".to_string(), json!("field-tablet"));
    };
    let mut payload = Entity::new();
    stamp.apply(&mut payload);
    assert_eq!(payload["source"], json!("field-tablet"));
  }
}
