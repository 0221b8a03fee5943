//! Version information for sarathi.

/// Sarathi version from Cargo.toml
pub const SARATHI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Bridge runtime version.
    pub sarathi: &'static str,
    /// Interpreter the helper scripts run under (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            sarathi: SARATHI_VERSION,
            python: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_python(mut self, python: String) -> Self {
        self.python = Some(python);
        self
    }
}
