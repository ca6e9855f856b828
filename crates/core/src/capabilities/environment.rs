//! Build target and version used to resolve catalog urls.

/// Provides the values substituted into catalog url templates
pub trait Environment: Send + Sync {
    fn build_target(&self) -> String;
    fn version(&self) -> String;
}

/// Fixed environment values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub build_target: String,
    pub version: String,
}

impl StaticEnvironment {
    pub fn new(build_target: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            build_target: build_target.into(),
            version: version.into(),
        }
    }
}

impl Environment for StaticEnvironment {
    fn build_target(&self) -> String {
        self.build_target.clone()
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}
