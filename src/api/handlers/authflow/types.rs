//! Request/response types for authflow endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::authflow::{Action, ServiceOutput};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateFlowRequest {
    /// `signup`, `login` or `account_recovery`.
    #[serde(rename = "type")]
    pub flow_type: String,
    #[serde(default = "default_flow_name")]
    pub name: String,
    /// Query string of the page that started the flow; overrides OAuth session values.
    #[serde(default)]
    pub url_query: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Vec<Object>>)]
    pub batch_input: Option<Vec<Value>>,
}

fn default_flow_name() -> String {
    crate::authflow::config::DEFAULT_FLOW_NAME.to_string()
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct InputRequest {
    /// Workflow id.
    pub id: String,
    /// Instance the input applies to; the current head when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// `{kind, data}`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub input: Option<Value>,
    #[serde(default)]
    #[schema(value_type = Option<Vec<Object>>)]
    pub batch_input: Option<Vec<Value>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct GetRequest {
    pub id: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq)]
pub struct ActionResponse {
    #[serde(rename = "type")]
    pub action_type: String,
    pub accepts: Vec<String>,
    #[schema(value_type = Object)]
    pub data: Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq)]
pub struct FlowResponse {
    pub workflow_id: String,
    pub instance_id: String,
    pub action: ActionResponse,
    pub finished: bool,
}

impl From<Action> for ActionResponse {
    fn from(action: Action) -> Self {
        Self {
            action_type: action.step,
            accepts: action.accepts,
            data: action.data,
        }
    }
}

impl From<ServiceOutput> for FlowResponse {
    fn from(output: ServiceOutput) -> Self {
        Self {
            workflow_id: output.workflow_id,
            instance_id: output.instance_id,
            action: output.action.into(),
            finished: output.finished,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorDetail {
    pub reason: String,
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    /// State the flow is still in, for errors the client can recover from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FlowResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;

    #[test]
    fn create_request_defaults_name() -> anyhow::Result<()> {
        let request: CreateFlowRequest = serde_json::from_value(json!({"type": "signup"}))?;
        assert_eq!(request.name, "default");
        assert!(request.batch_input.is_none());
        Ok(())
    }

    #[test]
    fn action_type_is_renamed() -> anyhow::Result<()> {
        let response = FlowResponse {
            workflow_id: "wf".to_string(),
            instance_id: "i1".to_string(),
            action: Action::new("identify", &["identification"], json!({})).into(),
            finished: false,
        };
        let value = serde_json::to_value(&response)?;
        let action_type = value
            .pointer("/action/type")
            .and_then(Value::as_str)
            .context("missing action type")?;
        assert_eq!(action_type, "identify");
        Ok(())
    }
}
