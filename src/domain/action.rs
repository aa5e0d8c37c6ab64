//! Action leaf facts: an effect performed when the enclosing branch holds.
//!
//! `LOG_MESSAGE` and `PLACE_ORDER` have a parameter schema that is enforced on
//! creation and on every patch. Any other action type is stored with opaque
//! parameters.

use crate::domain::error::BlocktraderError;
use crate::domain::ids::ActionId;
use crate::domain::payload::{self, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOG_MESSAGE: &str = "LOG_MESSAGE";
pub const PLACE_ORDER: &str = "PLACE_ORDER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    pub action_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Display-only copy of the owning block's order. Execution order comes
    /// from the block.
    #[serde(default)]
    pub order: u32,
}

impl Action {
    pub fn patched(&self, patch: &ActionPayload) -> Result<Action, BlocktraderError> {
        patch.resolve(self.id, self.order, Some(self))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionPayload {
    pub action_type: Option<Value>,
    pub parameters: Option<Value>,
}

impl ActionPayload {
    pub fn new(action_type: &str, parameters: Parameters) -> Self {
        Self {
            action_type: Some(action_type.into()),
            parameters: Some(Value::Object(parameters)),
        }
    }

    pub fn log_message(message: &str) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert("message".into(), message.into());
        Self::new(LOG_MESSAGE, parameters)
    }

    pub fn into_action(self, id: ActionId, order: u32) -> Result<Action, BlocktraderError> {
        self.resolve(id, order, None)
    }

    fn resolve(
        &self,
        id: ActionId,
        order: u32,
        current: Option<&Action>,
    ) -> Result<Action, BlocktraderError> {
        let action_type = payload::required_text(
            self.action_type.as_ref(),
            current.map(|a| a.action_type.as_str()),
            "actionType",
        )?
        .to_uppercase();
        let parameters = payload::parameters(
            self.parameters.as_ref(),
            current.map(|a| &a.parameters),
            "parameters",
        )?;
        check_schema(&action_type, &parameters)?;
        Ok(Action {
            id,
            action_type,
            parameters,
            order,
        })
    }
}

impl From<&Action> for ActionPayload {
    fn from(action: &Action) -> Self {
        Self::new(&action.action_type, action.parameters.clone())
    }
}

fn check_schema(action_type: &str, parameters: &Parameters) -> Result<(), BlocktraderError> {
    match action_type {
        LOG_MESSAGE => {
            payload::required_text(parameters.get("message"), None, "parameters.message")?;
        }
        PLACE_ORDER => {
            payload::required_text(parameters.get("symbol"), None, "parameters.symbol")?;
            let side = payload::required_text(parameters.get("side"), None, "parameters.side")?;
            if !matches!(side.to_uppercase().as_str(), "BUY" | "SELL") {
                return Err(BlocktraderError::invalid(
                    "parameters.side",
                    "must be BUY or SELL",
                ));
            }
            let quantity = parameters
                .get("quantity")
                .ok_or_else(|| BlocktraderError::invalid("parameters.quantity", "is required"))?;
            if payload::number(quantity, "parameters.quantity")? <= 0.0 {
                return Err(BlocktraderError::invalid(
                    "parameters.quantity",
                    "must be positive",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}
