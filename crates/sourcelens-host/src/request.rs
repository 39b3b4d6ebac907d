use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sourcelens_core::key::SessionKey;
use sourcelens_core::position::{LspPosition, adjust_for_extracted_text};
use thiserror::Error;

use crate::envelope::PositionEcho;
use crate::settings::SettingsUpdate;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown request: {0}")]
    Unknown(String),
    #[error("invalid {request} request: {reason}")]
    Invalid { request: String, reason: String },
}

/// One message from the extension, before its arguments are validated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_name: String,
    #[serde(default)]
    pub user_info: Value,
    #[serde(default)]
    pub tab_id: Option<Value>,
}

impl InboundMessage {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn request(&self) -> Result<Request, RequestError> {
        Request::parse(&self.message_name, &self.user_info)
    }

    /// `userInfo` as echoed on replies; absent when the request had none.
    pub fn reply_user_info(&self) -> Option<Value> {
        (!self.user_info.is_null()).then(|| self.user_info.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageArgs {
    pub resource: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionArgs {
    pub resource: String,
    pub slug: String,
}

impl SessionArgs {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.resource, &self.slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentArgs {
    #[serde(flatten)]
    pub session: SessionArgs,
    pub filepath: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenArgs {
    #[serde(flatten)]
    pub document: DocumentArgs,
    pub text: String,
}

/// A token position on the rendered page. `text` is the token the user
/// pointed at, which may carry leading whitespace or a member-access dot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PositionArgs {
    #[serde(flatten)]
    pub document: DocumentArgs,
    pub line: u32,
    pub character: u32,
    pub text: String,
}

impl PositionArgs {
    pub fn position(&self) -> LspPosition {
        adjust_for_extracted_text(self.line, self.character, &self.text)
    }

    pub fn echo(&self) -> PositionEcho {
        PositionEcho {
            line: self.line,
            character: self.character,
            text: self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryArgs {
    pub url: String,
}

/// `resource` alone narrows the poll to the latest synchronization on that
/// code host; with `slug` it names one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressArgs {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl ProgressArgs {
    pub fn key(&self) -> Option<SessionKey> {
        let key = SessionKey::new(self.resource.as_deref()?, self.slug.as_deref()?);
        key.is_complete().then_some(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Initialize(PageArgs),
    DidOpen(OpenArgs),
    DocumentSymbol(DocumentArgs),
    Hover(PositionArgs),
    Definition(PositionArgs),
    References(PositionArgs),
    DocumentHighlight(PositionArgs),
    Shutdown(SessionArgs),
    Exit(SessionArgs),
    Settings,
    UpdateSettings(SettingsUpdate),
    Repository(RepositoryArgs),
    CheckoutRepository(RepositoryArgs),
    DeleteRepository(RepositoryArgs),
    BuildProgress(ProgressArgs),
    Reset,
}

impl Request {
    pub fn parse(name: &str, user_info: &Value) -> Result<Self, RequestError> {
        let request = match name {
            "initialize" => Self::Initialize(args(name, user_info)?),
            "didOpen" => Self::DidOpen(args(name, user_info)?),
            "documentSymbol" => Self::DocumentSymbol(args(name, user_info)?),
            "hover" => Self::Hover(args(name, user_info)?),
            "definition" => Self::Definition(args(name, user_info)?),
            "references" => Self::References(args(name, user_info)?),
            "documentHighlight" => Self::DocumentHighlight(args(name, user_info)?),
            "shutdown" => Self::Shutdown(args(name, user_info)?),
            "exit" => Self::Exit(args(name, user_info)?),
            "settings" => Self::Settings,
            "updateSettings" => Self::UpdateSettings(args(name, user_info)?),
            "repository" => Self::Repository(args(name, user_info)?),
            "checkoutRepository" => Self::CheckoutRepository(args(name, user_info)?),
            "deleteRepository" => Self::DeleteRepository(args(name, user_info)?),
            "buildProgress" => Self::BuildProgress(if user_info.is_null() {
                ProgressArgs::default()
            } else {
                args(name, user_info)?
            }),
            "reset" => Self::Reset,
            other => return Err(RequestError::Unknown(other.to_string())),
        };
        request.validate(name)?;
        Ok(request)
    }

    fn validate(&self, name: &str) -> Result<(), RequestError> {
        let session = match self {
            Self::DidOpen(args) => Some(&args.document.session),
            Self::DocumentSymbol(args) => Some(&args.session),
            Self::Hover(args)
            | Self::Definition(args)
            | Self::References(args)
            | Self::DocumentHighlight(args) => Some(&args.document.session),
            Self::Shutdown(args) | Self::Exit(args) => Some(args),
            _ => None,
        };
        if let Some(session) = session
            && !session.key().is_complete()
        {
            return Err(invalid(
                name,
                format!("{:?} / {:?} does not name a repository", session.resource, session.slug),
            ));
        }

        let filepath = match self {
            Self::DidOpen(args) => Some(&args.document.filepath),
            Self::DocumentSymbol(args) => Some(&args.filepath),
            Self::Hover(args)
            | Self::Definition(args)
            | Self::References(args)
            | Self::DocumentHighlight(args) => Some(&args.document.filepath),
            _ => None,
        };
        if let Some(filepath) = filepath
            && filepath.trim().is_empty()
        {
            return Err(invalid(name, "filepath is empty"));
        }

        let url = match self {
            Self::Repository(args) | Self::CheckoutRepository(args) | Self::DeleteRepository(args) => {
                Some(&args.url)
            }
            Self::Initialize(args) => Some(&args.href),
            _ => None,
        };
        if let Some(url) = url
            && url.trim().is_empty()
        {
            return Err(invalid(name, "url is empty"));
        }
        Ok(())
    }
}

fn args<T: DeserializeOwned>(name: &str, user_info: &Value) -> Result<T, RequestError> {
    T::deserialize(user_info).map_err(|err| invalid(name, err))
}

fn invalid(name: &str, reason: impl ToString) -> RequestError {
    RequestError::Invalid {
        request: name.to_string(),
        reason: reason.to_string(),
    }
}
