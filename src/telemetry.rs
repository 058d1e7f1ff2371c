//! Log subscriber and OpenTelemetry meter bootstrap shared by the binaries.
//!
//! Recognised environment:
//! - `METASYNC_LOG_FORMAT`: `json` (default) or `pretty`
//! - `METASYNC_TELEMETRY_ENABLED`: register the meter provider globally (default: true)
//! - `METASYNC_TELEMETRY_RUN_ID`: stamped on the resource as `metasync.run_id`
//! - `OTEL_SERVICE_NAME`, `OTEL_RESOURCE_ATTRIBUTES`

use crate::config::parse_bool;
use crate::{Error, Result};

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(Error::Config(format!(
                "METASYNC_LOG_FORMAT must be json or pretty, got '{other}'"
            ))),
        }
    }
}

/// Settings resolved before anything is installed.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub service_name: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub run_id: Option<String>,
    /// Sorted, deduplicated resource attributes.
    pub resource: BTreeMap<String, String>,
}

impl TelemetrySettings {
    pub fn from_env(default_service: &str) -> Result<Self> {
        Self::from_lookup(default_service, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(default_service: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("OTEL_SERVICE_NAME")
            .unwrap_or_else(|| default_service.to_string())
            .trim()
            .to_string();
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME is empty".to_string()));
        }

        let log_format = match lookup("METASYNC_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::Json,
        };
        let metrics_enabled = match lookup("METASYNC_TELEMETRY_ENABLED") {
            Some(raw) => parse_bool("METASYNC_TELEMETRY_ENABLED", &raw)?,
            None => true,
        };
        let run_id = lookup("METASYNC_TELEMETRY_RUN_ID")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());

        let mut resource = parse_resource_attributes(
            &lookup("OTEL_RESOURCE_ATTRIBUTES").unwrap_or_default(),
        )?;
        resource.insert("service.name".to_string(), service_name.clone());
        resource
            .entry("service.namespace".to_string())
            .or_insert_with(|| "metasync".to_string());
        if let Some(run_id) = &run_id {
            resource.insert("metasync.run_id".to_string(), run_id.clone());
        }

        Ok(Self {
            service_name,
            log_format,
            metrics_enabled,
            run_id,
            resource,
        })
    }
}

/// Keeps the meter provider alive; flushes it on drop.
pub struct Telemetry {
    settings: TelemetrySettings,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Install the log subscriber at `log_level` and, unless disabled, a
    /// global meter provider tagged with the resolved resource.
    pub fn init_for_component(default_service: &str, log_level: &str) -> Result<Self> {
        let settings = TelemetrySettings::from_env(default_service)?;
        let level: Level = log_level
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid log level '{log_level}'")))?;

        let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);
        match settings.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.try_init(),
        }
        .map_err(|e| Error::Config(format!("log subscriber already installed: {e}")))?;

        let meter_provider = settings.metrics_enabled.then(|| {
            let attributes = settings
                .resource
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone()));
            let provider = SdkMeterProvider::builder()
                .with_resource(Resource::default().merge(&Resource::new(attributes)))
                .build();
            global::set_meter_provider(provider.clone());
            provider
        });

        info!(
            service = %settings.service_name,
            metrics = settings.metrics_enabled,
            run_id = settings.run_id.as_deref().unwrap_or("none"),
            "telemetry ready"
        );

        Ok(Self {
            settings,
            meter_provider,
        })
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Parse `key=value,key=value`; later keys win.
fn parse_resource_attributes(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                attrs.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(Error::Config(format!(
                    "OTEL_RESOURCE_ATTRIBUTES entry '{entry}' is not key=value"
                )))
            }
        }
    }
    Ok(attrs)
}
