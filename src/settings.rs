//! Configuration resolver binding named sections to typed settings.
//!
//! Settings come from a TOML file overlaid with environment variables
//! prefixed by `LIQUID__`, where `__` separates nested keys:
//!
//! ```toml
//! [messaging.orders]
//! bootstrap_servers = "localhost:9092"
//! group_id = "billing"
//! ```
//!
//! is overridden by `LIQUID__MESSAGING__ORDERS__GROUP_ID=shipping`.
//!
//! Every connection id resolves to the section `messaging.<connection_id>`,
//! which the connection's [`Cartridge`](crate::Cartridge) binds into its own
//! settings type.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use tracing_error::SpanTrace;

/// Root section holding one sub-section per connection id.
pub const MESSAGING_SECTION: &str = "messaging";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LIQUID";

/// Loaded configuration tree.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    config: Config,
}

impl Settings {
    /// Load `path` (format inferred from its extension) and apply
    /// environment overrides.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(environment())
            .build()
            .map_err(SettingsError::load)?;

        Ok(Self { config })
    }

    /// Parse settings from a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(SettingsError::load)?;

        Ok(Self { config })
    }

    /// Wrap an already assembled configuration.
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Bind the section `name` (dot separated) into `T`.
    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Result<T, SettingsError> {
        self.config.get::<T>(name).map_err(|e| match e {
            config::ConfigError::NotFound(_) => SettingsError::missing_section(name),
            other => SettingsError::bind(name, other),
        })
    }

    /// Bind the settings of connection `connection_id`.
    pub fn connection<T: DeserializeOwned>(&self, connection_id: &str) -> Result<T, SettingsError> {
        self.section(&connection_section(connection_id))
    }
}

/// Section name holding the settings of `connection_id`.
pub fn connection_section(connection_id: &str) -> String {
    format!("{MESSAGING_SECTION}.{connection_id}")
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Error returned while loading or binding settings.
#[derive(Debug)]
pub struct SettingsError {
    context: SpanTrace,
    kind: SettingsErrorKind,
}

/// Settings errors kind.
#[derive(Debug)]
pub enum SettingsErrorKind {
    /// The configuration sources could not be read or parsed.
    Load(config::ConfigError),
    /// No section exists under the requested name.
    MissingSection(String),
    /// The section exists but does not match the requested type.
    Bind {
        section: String,
        source: config::ConfigError,
    },
}

impl SettingsError {
    fn load(err: config::ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SettingsErrorKind::Load(err),
        }
    }

    fn missing_section(section: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SettingsErrorKind::MissingSection(section.to_owned()),
        }
    }

    fn bind(section: &str, source: config::ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SettingsErrorKind::Bind {
                section: section.to_owned(),
                source,
            },
        }
    }

    pub fn kind(&self) -> &SettingsErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SettingsErrorKind::Load(err) => writeln!(f, "Failed to load settings: {err}"),
            SettingsErrorKind::MissingSection(section) => {
                writeln!(f, "Missing settings section: {section}")
            }
            SettingsErrorKind::Bind { section, source } => {
                writeln!(f, "Invalid settings section {section}: {source}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SettingsErrorKind::Load(err) => Some(err),
            SettingsErrorKind::MissingSection(_) => None,
            SettingsErrorKind::Bind { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConsumerParameter, transport::InMemorySettings};
    use std::io::Write as _;

    const SETTINGS: &str = r#"
        [messaging.local]
        max_delivery_count = 3
        lock_duration_ms = 250

        [messaging.defaults]

        [consumers.billing]
        connection_id = "local"
        destination = "invoices"
        auto_complete = true
        max_concurrent_calls = 4
    "#;

    #[test]
    fn binds_connection_section_values() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();

        let bound: InMemorySettings = settings.connection("local").unwrap();
        assert_eq!(
            bound,
            InMemorySettings {
                max_delivery_count: 3,
                lock_duration_ms: Some(250),
                ..InMemorySettings::default()
            }
        );
    }

    #[test]
    fn empty_section_uses_defaults() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();

        let bound: InMemorySettings = settings.connection("defaults").unwrap();
        assert_eq!(bound, InMemorySettings::default());
    }

    #[test]
    fn binds_parameters_from_configuration() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();

        let parameter: ConsumerParameter = settings.section("consumers.billing").unwrap();
        assert_eq!(
            parameter,
            ConsumerParameter::new("local", "invoices")
                .with_auto_complete(true)
                .with_max_concurrent_calls(4)
        );
    }

    #[test]
    fn missing_section_is_reported() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();

        let err = settings.connection::<InMemorySettings>("absent").unwrap_err();
        assert!(matches!(
            err.kind(),
            SettingsErrorKind::MissingSection(section) if section == "messaging.absent"
        ));
    }

    #[test]
    fn mistyped_section_is_a_bind_error() {
        let settings =
            Settings::from_toml_str("[messaging.broken]\nmax_delivery_count = \"many\"").unwrap();

        let err = settings.connection::<InMemorySettings>("broken").unwrap_err();
        assert!(matches!(err.kind(), SettingsErrorKind::Bind { .. }));
    }

    #[test]
    fn loads_from_file() {
        let dir = std::env::temp_dir().join(format!("liquid-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("messaging.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SETTINGS.as_bytes())
            .unwrap();

        let settings = Settings::load(&path).unwrap();
        let bound: InMemorySettings = settings.connection("local").unwrap();
        assert_eq!(bound.max_delivery_count, 3);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
