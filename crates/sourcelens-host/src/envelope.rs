use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    /// A request was rejected or an analysis call failed.
    Error,
    /// Nothing needed doing.
    Skip,
    /// A repository synchronization failed.
    Failure,
}

/// Position fields echoed back on positional replies so the extension can
/// match a reply to the token it asked about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionEcho {
    pub line: u32,
    pub character: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub request: String,
    pub result: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub echo: Option<PositionEcho>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

impl Envelope {
    fn new(request: &str, result: Outcome) -> Self {
        Self {
            request: request.to_string(),
            result,
            value: None,
            message: None,
            echo: None,
            tab_id: None,
            user_info: None,
        }
    }

    pub fn success(request: &str, value: Option<Value>) -> Self {
        Self {
            value,
            ..Self::new(request, Outcome::Success)
        }
    }

    pub fn error(request: &str, message: impl ToString) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::new(request, Outcome::Error)
        }
    }

    pub fn failure(request: &str, message: impl ToString) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::new(request, Outcome::Failure)
        }
    }

    pub fn skip(request: &str) -> Self {
        Self::new(request, Outcome::Skip)
    }

    pub fn with_echo(mut self, echo: PositionEcho) -> Self {
        self.echo = Some(echo);
        self
    }

    /// Routes the reply back to the tab and context the request came from.
    pub fn addressed(mut self, tab_id: Option<Value>, user_info: Option<Value>) -> Self {
        self.tab_id = tab_id;
        self.user_info = user_info;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            serde_json::json!({
                "request": self.request,
                "result": Outcome::Error,
                "message": format!("failed to encode response: {err}"),
            })
        })
    }
}
