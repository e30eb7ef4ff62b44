//! Per-operation wall-clock budgets
//!
//! Each operation category (create, update, delete) carries its own timeout.
//! Resource types declare defaults; configurations may override them with a
//! `timeouts` map attribute such as `{"create": "45m", "delete": "90s"}`.

use std::collections::HashMap;
use std::time::Duration;

use crate::resource::Value;

/// Attribute holding timeout overrides
pub const TIMEOUTS_ATTRIBUTE: &str = "timeouts";

/// Operation category a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    fn key(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    /// 20 minutes for every category
    fn default() -> Self {
        Self::uniform(Duration::from_secs(20 * 60))
    }
}

impl Timeouts {
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            update: timeout,
            delete: timeout,
        }
    }

    pub const fn from_minutes(create: u64, update: u64, delete: u64) -> Self {
        Self {
            create: Duration::from_secs(create * 60),
            update: Duration::from_secs(update * 60),
            delete: Duration::from_secs(delete * 60),
        }
    }

    pub fn get(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Create => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }

    /// Apply overrides found in the `timeouts` attribute
    ///
    /// Unknown keys are ignored; malformed durations are reported.
    pub fn with_overrides(mut self, attributes: &HashMap<String, Value>) -> Result<Self, String> {
        let Some(Value::Map(overrides)) = attributes.get(TIMEOUTS_ATTRIBUTE) else {
            return Ok(self);
        };

        for operation in [Operation::Create, Operation::Update, Operation::Delete] {
            let Some(value) = overrides.get(operation.key()) else {
                continue;
            };
            let parsed = match value {
                Value::String(s) => parse_duration(s)?,
                Value::Int(secs) if *secs >= 0 => Duration::from_secs(*secs as u64),
                other => {
                    return Err(format!(
                        "timeouts.{} must be a duration string, got {:?}",
                        operation.key(),
                        other
                    ));
                }
            };
            match operation {
                Operation::Create => self.create = parsed,
                Operation::Update => self.update = parsed,
                Operation::Delete => self.delete = parsed,
            }
        }

        Ok(self)
    }
}

/// Parse a duration such as `"30s"`, `"10m"`, `"1h30m"`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(format!("invalid duration '{}': unknown unit '{}'", input, c)),
        };
        if digits.is_empty() {
            return Err(format!("invalid duration '{}': missing number", input));
        }
        total = digits
            .parse::<u64>()
            .ok()
            .and_then(|amount| amount.checked_mul(unit))
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("invalid duration '{}': too large", input))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("invalid duration '{}': missing unit", input));
    }

    Ok(Duration::from_secs(total))
}
