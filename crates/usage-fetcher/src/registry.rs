//! Fetcher registry
//!
//! Maps a configured type name to a constructor. Resolution happens once at
//! startup; an unknown type or bad arguments is a configuration error.

use crate::config::FetcherConfig;
use crate::datadog::{DatadogArgs, DatadogFetcher};
use crate::dummy::{DummyArgs, DummyFetcher};
use crate::fetcher::Fetcher;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use usage_common::{AccountantError, Result};

/// Everything a constructor gets from one configuration entry
#[derive(Debug, Clone)]
pub struct FetcherContext {
    /// Instance name used in logs and metrics
    pub name: String,
    pub period: Duration,
    pub args: serde_json::Value,
}

impl FetcherContext {
    /// Deserialize the implementation-specific arguments
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        let args = match &self.args {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(args)
            .map_err(|e| AccountantError::Config(format!("{}: invalid args: {}", self.name, e)))
    }
}

/// A resolved fetcher and its poll period
#[derive(Clone)]
pub struct ScheduledFetcher {
    pub fetcher: Arc<dyn Fetcher>,
    pub period: Duration,
}

type Constructor = Box<dyn Fn(&FetcherContext) -> Result<Arc<dyn Fetcher>> + Send + Sync>;

/// Type name to constructor map
#[derive(Default)]
pub struct FetcherRegistry {
    constructors: HashMap<String, Constructor>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `dummy` and `datadog`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("dummy", |ctx| {
            let args: DummyArgs = ctx.args()?;
            Ok(Arc::new(DummyFetcher::new(ctx.name.clone(), args)?) as Arc<dyn Fetcher>)
        });
        registry.register("datadog", |ctx| {
            let args: DatadogArgs = ctx.args()?;
            Ok(Arc::new(DatadogFetcher::new(ctx.name.clone(), args, ctx.period)?) as Arc<dyn Fetcher>)
        });
        registry
    }

    /// Register a constructor; type names are case-insensitive
    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(&FetcherContext) -> Result<Arc<dyn Fetcher>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_ascii_lowercase(), Box::new(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(&type_name.to_ascii_lowercase())
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Construct one fetcher
    pub fn build(&self, type_name: &str, ctx: &FetcherContext) -> Result<Arc<dyn Fetcher>> {
        let constructor = self
            .constructors
            .get(&type_name.to_ascii_lowercase())
            .ok_or_else(|| {
                AccountantError::Config(format!(
                    "unknown fetcher type '{}' (known: {})",
                    type_name,
                    self.types().join(", ")
                ))
            })?;
        constructor(ctx)
    }

    /// Construct every configured fetcher
    pub fn resolve(&self, entries: &[FetcherConfig]) -> Result<Vec<ScheduledFetcher>> {
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let ctx = FetcherContext {
                    name: entry.instance_name(index),
                    period: entry.period()?,
                    args: entry.args.clone(),
                };
                let fetcher = self.build(&entry.kind, &ctx)?;
                info!(fetcher = %ctx.name, kind = %entry.kind, period = ?ctx.period, "Fetcher resolved");
                Ok(ScheduledFetcher {
                    fetcher,
                    period: ctx.period,
                })
            })
            .collect()
    }
}
