use std::collections::BTreeMap;

pub const SERVER_PATH: &str = "serverPath";
pub const SDK_PATH: &str = "SDKPath";
pub const TARGET: &str = "target";
pub const TOOLCHAIN: &str = "toolchain";
pub const ACCESS_TOKEN: &str = "accessToken";

/// Per-request settings handed to session and sync calls. Empty values are
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    values: BTreeMap<String, String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn server_path(&self) -> Option<&str> {
        self.get(SERVER_PATH)
    }

    pub fn sdk_path(&self) -> Option<&str> {
        self.get(SDK_PATH).or_else(|| self.get("sdkPath"))
    }

    pub fn target(&self) -> Option<&str> {
        self.get(TARGET)
    }

    pub fn toolchain(&self) -> Option<&str> {
        self.get(TOOLCHAIN)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get(ACCESS_TOKEN)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
