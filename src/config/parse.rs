use super::types::*;
use crate::config::{env_var_regex, expand_env_vars, expand_tilde};
use crate::formatter::FormatterRegistry;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Read, expand and validate a config file
pub fn load_config(path: &Path, formatters: &FormatterRegistry) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string, formatters)
}

/// Parse and validate config from a YAML string
pub fn parse_config(yaml: &str, formatters: &FormatterRegistry) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    config.state.dir = expand_tilde(&config.state.dir);
    for source in &mut config.sources {
        source.pattern = expand_tilde(Path::new(&source.pattern))
            .to_string_lossy()
            .into_owned();
    }

    validate_config(&config, formatters)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded: Vec<String> = env_var_regex()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded.is_empty() {
        return Ok(());
    }

    unexpanded.sort();
    unexpanded.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        unexpanded.join(", ")
    )))
}

fn validate_config(config: &Config, formatters: &FormatterRegistry) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.sources.is_empty() {
        errors.push("config must have at least one entry in 'sources'".to_string());
    }

    for (i, source) in config.sources.iter().enumerate() {
        validate_source(&format!("sources[{}]", i), source, formatters, &mut errors);
    }

    if config.sink.address.trim().is_empty() {
        errors.push("sink.address cannot be empty".to_string());
    }
    if config.sink.topic.trim().is_empty() {
        errors.push("sink.topic cannot be empty".to_string());
    }
    if config.sink.heartbeat_topic.trim().is_empty() {
        errors.push("sink.heartbeat_topic cannot be empty".to_string());
    }

    if config.queue.capacity == 0 {
        errors.push("queue.capacity must be greater than zero".to_string());
    }
    if config.sender.max_batch_bytes == 0 {
        errors.push("sender.max_batch_bytes must be greater than zero".to_string());
    }

    let intervals: [(&str, Duration); 11] = [
        ("sink.timeout", config.sink.timeout),
        ("queue.put_timeout", config.queue.put_timeout),
        ("queue.get_timeout", config.queue.get_timeout),
        ("sender.max_batch_age", config.sender.max_batch_age),
        ("sender.retry_wait", config.sender.retry_wait),
        ("sender.restart_delay", config.sender.restart_delay),
        ("tailer.poll_interval", config.tailer.poll_interval),
        ("tailer.restart_delay", config.tailer.restart_delay),
        ("scanner.interval", config.scanner.interval),
        ("heartbeat.interval", config.heartbeat.interval),
        ("heartbeat.restart_delay", config.heartbeat.restart_delay),
    ];
    for (name, value) in intervals {
        if value.is_zero() {
            errors.push(format!("{} must be greater than zero", name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(
    context: &str,
    source: &SourceConfig,
    formatters: &FormatterRegistry,
    errors: &mut Vec<String>,
) {
    if source.pattern.trim().is_empty() {
        errors.push(format!("{}: pattern cannot be empty", context));
    } else if let Err(e) = glob::Pattern::new(&source.pattern) {
        errors.push(format!(
            "{}: invalid glob pattern '{}': {}",
            context, source.pattern, e
        ));
    }

    if source.formatter.trim().is_empty() {
        errors.push(format!("{}: formatter cannot be empty", context));
    } else if !formatters.contains(&source.formatter) {
        errors.push(format!(
            "{}: unknown formatter '{}' (registered: {})",
            context,
            source.formatter,
            formatters.names().join(", ")
        ));
    }

    if let Some(continuation) = &source.continuation {
        if let Err(e) = Regex::new(continuation) {
            errors.push(format!(
                "{}: invalid continuation regex '{}': {}",
                context, continuation, e
            ));
        }
    }
}
