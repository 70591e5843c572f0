//! Configuration for midi-link
//!
//! Handles loading, parsing, validation and hot-reloading of the YAML file.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::Error;
use crate::pipeline::{OverflowPolicy, PipelineOptions};
use crate::search::DeviceSearchTerm;
use crate::slot::SlotOptions;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub send: SendConfig,
}

/// Which ports make up the device
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,
    pub input: DeviceSearchTerm,
    pub output: DeviceSearchTerm,
}

/// Connection thread timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Backoff between attempts while disconnected
    #[serde(default = "default_interval_ms")]
    pub retry_interval_ms: u64,
    /// Enumeration poll while connected
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_interval_ms(),
            poll_interval_ms: default_interval_ms(),
        }
    }
}

/// Send pipeline sizing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SendConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl From<&TimingConfig> for SlotOptions {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            retry_interval: Duration::from_millis(timing.retry_interval_ms),
            poll_interval: Duration::from_millis(timing.poll_interval_ms),
        }
    }
}

impl From<&SendConfig> for PipelineOptions {
    fn from(send: &SendConfig) -> Self {
        Self {
            buffer_capacity: send.buffer_capacity,
            overflow: send.overflow,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml_str(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for correctness
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.timing.retry_interval_ms == 0 {
            return Err(Error::Config("timing.retry_interval_ms must be greater than 0".into()));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(Error::Config("timing.poll_interval_ms must be greater than 0".into()));
        }
        // One channel-voice message must always fit
        if self.send.buffer_capacity < 3 {
            return Err(Error::Config(format!(
                "send.buffer_capacity must be at least 3 bytes (got {})",
                self.send.buffer_capacity
            )));
        }
        if self.device.name.is_empty() {
            return Err(Error::Config("device.name cannot be empty".into()));
        }
        Ok(())
    }

    pub fn slot_options(&self) -> SlotOptions {
        SlotOptions::from(&self.timing)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions::from(&self.send)
    }
}

// Default value functions
fn default_device_name() -> String { "midi-device".to_string() }
fn default_interval_ms() -> u64 { 1000 }
fn default_buffer_capacity() -> usize { 4096 }
