use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupData {
    pub metadata: PackageMetadata,
    #[serde(default)]
    pub setup: SetupSection,
    pub runtime: Option<RuntimeRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupSection {
    pub title: Option<String>,
    pub info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeRequirement {
    pub name: String,
    pub key: String,
    pub version: String,
}

impl SetupData {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let setup: Self = toml::from_str(input).context("failed to parse retrace setup data")?;
        validate_package_token("package name", &setup.metadata.name)?;
        validate_package_token("package version", &setup.metadata.version)?;
        if let Some(runtime) = &setup.runtime {
            if runtime.key.trim().is_empty() {
                return Err(anyhow!(
                    "runtime registry key must not be empty for '{}'",
                    runtime.name
                ));
            }
            if runtime.version.trim().is_empty() {
                return Err(anyhow!(
                    "runtime version must not be empty for '{}'",
                    runtime.name
                ));
            }
        }
        Ok(setup)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize retrace setup data")
    }

    pub fn title(&self) -> String {
        self.setup.title.clone().unwrap_or_else(|| {
            format!("{}-{}", self.metadata.name, self.metadata.version)
        })
    }

    pub fn display_name(&self) -> String {
        match &self.runtime {
            Some(runtime) => format!("{} {} {}", runtime.name, runtime.version, self.title()),
            None => self.title(),
        }
    }

    pub fn uninstall_subkey_name(&self) -> String {
        format!("{}-{}", self.metadata.name, self.metadata.version)
    }
}

fn validate_package_token(field: &str, value: &str) -> anyhow::Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("{field} must not be empty"));
    }
    if trimmed != value {
        return Err(anyhow!("{field} must not have surrounding whitespace: '{value}'"));
    }
    if value
        .chars()
        .any(|ch| matches!(ch, '/' | '\\' | ':' | '[' | ']') || ch.is_control())
    {
        return Err(anyhow!(
            "{field} contains invalid character(s): {value}"
        ));
    }
    if value == "." || value == ".." {
        return Err(anyhow!("{field} must not be a relative path token: {value}"));
    }
    Ok(())
}
