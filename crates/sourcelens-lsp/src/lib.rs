mod error;
mod launcher;
mod lsp;
mod registry;
mod session;
mod symbol;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::SessionError;
pub use launcher::{
    DEFAULT_SERVER_COMMAND, LaunchSpec, ProcessLauncher, ServerIo, ServerLauncher,
    preflight_server, resolve_server_command,
};
pub use lsp::{LspLocation, LspRange, path_to_uri, uri_to_path};
pub use registry::{RegistryOptions, SessionRegistry};
pub use session::{AnalysisSession, InitializeOutcome, SessionOptions, SessionState};
pub use sourcelens_core::position::LspPosition;
pub use symbol::{HighlightEntry, LocationEntry, SymbolEntry, symbol_kind_label};
