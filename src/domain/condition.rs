//! Condition leaf facts: an indicator compared against a target value.
//!
//! Clients send conditions as loosely typed JSON ([`ConditionPayload`]); the
//! payload is checked field by field and turned into a [`Condition`] so that a
//! malformed request surfaces as `InvalidPayload` naming the offending field.

use crate::domain::error::BlocktraderError;
use crate::domain::ids::ConditionId;
use crate::domain::payload::{self, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
    CrossesAbove,
    CrossesBelow,
}

impl Operator {
    pub const ALL: [Operator; 8] = [
        Operator::LessThan,
        Operator::LessThanOrEqual,
        Operator::GreaterThan,
        Operator::GreaterThanOrEqual,
        Operator::Equal,
        Operator::NotEqual,
        Operator::CrossesAbove,
        Operator::CrossesBelow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::CrossesAbove => "CROSSES_ABOVE",
            Operator::CrossesBelow => "CROSSES_BELOW",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = BlocktraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == wanted)
            .ok_or_else(|| BlocktraderError::invalid("operator", format!("unknown operator {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: ConditionId,
    pub indicator_type: String,
    pub symbol: String,
    pub interval: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub operator: Operator,
    pub target_value: f64,
}

impl Condition {
    /// Applies `patch` on top of the current field values. The identity is
    /// kept; the result is re-validated as a whole.
    pub fn patched(&self, patch: &ConditionPayload) -> Result<Condition, BlocktraderError> {
        patch.resolve(self.id, Some(self))
    }
}

/// Condition fields as received from a client. Every field is optional so the
/// same shape serves as a creation payload and as a partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionPayload {
    pub indicator_type: Option<Value>,
    pub symbol: Option<Value>,
    pub interval: Option<Value>,
    pub parameters: Option<Value>,
    pub operator: Option<Value>,
    pub target_value: Option<Value>,
}

impl ConditionPayload {
    pub fn new(
        indicator_type: &str,
        symbol: &str,
        interval: &str,
        operator: Operator,
        target_value: f64,
    ) -> Self {
        Self {
            indicator_type: Some(indicator_type.into()),
            symbol: Some(symbol.into()),
            interval: Some(interval.into()),
            parameters: None,
            operator: Some(operator.as_str().into()),
            target_value: Some(target_value.into()),
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(Value::Object(parameters));
        self
    }

    /// Validates a creation payload; every required field must be present.
    pub fn into_condition(self, id: ConditionId) -> Result<Condition, BlocktraderError> {
        self.resolve(id, None)
    }

    fn resolve(
        &self,
        id: ConditionId,
        current: Option<&Condition>,
    ) -> Result<Condition, BlocktraderError> {
        let indicator_type = payload::required_text(
            self.indicator_type.as_ref(),
            current.map(|c| c.indicator_type.as_str()),
            "indicatorType",
        )?
        .to_uppercase();
        let symbol = payload::required_text(
            self.symbol.as_ref(),
            current.map(|c| c.symbol.as_str()),
            "symbol",
        )?
        .to_uppercase();
        let interval = payload::required_text(
            self.interval.as_ref(),
            current.map(|c| c.interval.as_str()),
            "interval",
        )?;

        let operator = match payload::present(self.operator.as_ref()) {
            Some(Value::String(s)) => s.parse()?,
            Some(_) => return Err(BlocktraderError::invalid("operator", "must be a string")),
            None => current
                .map(|c| c.operator)
                .ok_or_else(|| BlocktraderError::invalid("operator", "is required"))?,
        };

        let target_value = match payload::present(self.target_value.as_ref()) {
            Some(value) => payload::number(value, "targetValue")?,
            None => current
                .map(|c| c.target_value)
                .ok_or_else(|| BlocktraderError::invalid("targetValue", "is required"))?,
        };

        let parameters = payload::parameters(
            self.parameters.as_ref(),
            current.map(|c| &c.parameters),
            "parameters",
        )?;

        Ok(Condition {
            id,
            indicator_type,
            symbol,
            interval,
            parameters,
            operator,
            target_value,
        })
    }
}

impl From<&Condition> for ConditionPayload {
    fn from(condition: &Condition) -> Self {
        Self::new(
            &condition.indicator_type,
            &condition.symbol,
            &condition.interval,
            condition.operator,
            condition.target_value,
        )
        .with_parameters(condition.parameters.clone())
    }
}
