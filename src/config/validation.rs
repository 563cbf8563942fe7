use crate::config::types::{
    ApiConfig, Config, CrawlerConfig, CredentialConfig, HealthConfig, OutputConfig, RetryConfig,
};
use crate::ConfigError;
use url::Url;

/// Placeholder substituted with a parent's natural ID
pub const PARENT_ID_PLACEHOLDER: &str = "{parent_id}";

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_api_config(&config.api)?;
    validate_credential_config(&config.credentials)?;
    validate_health_config(&config.health)?;
    validate_retry_config(&config.retry)?;
    validate_output_config(&config.output)?;
    Ok(())
}

fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_concurrency < 1 || config.max_concurrency > 32 {
        return Err(ConfigError::Validation(format!(
            "max_concurrency must be between 1 and 32, got {}",
            config.max_concurrency
        )));
    }

    if config.page_size < 1 || config.page_size > 100 {
        return Err(ConfigError::Validation(format!(
            "page_size must be between 1 and 100, got {}",
            config.page_size
        )));
    }

    if config.inter_request_delay_min_ms > config.inter_request_delay_max_ms {
        return Err(ConfigError::Validation(format!(
            "inter_request_delay_min_ms ({}) must not exceed inter_request_delay_max_ms ({})",
            config.inter_request_delay_min_ms, config.inter_request_delay_max_ms
        )));
    }

    if config.max_pages < 1 {
        return Err(ConfigError::Validation(
            "max_pages must be >= 1".to_string(),
        ));
    }

    if config.max_items_per_parent == Some(0) {
        return Err(ConfigError::Validation(
            "max_items_per_parent must be >= 1 when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    Url::parse(&config.search_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid search_url: {}", e)))?;

    for (name, template) in [
        ("children_url", &config.children_url),
        ("parent_page_url", &config.parent_page_url),
    ] {
        if !template.contains(PARENT_ID_PLACEHOLDER) {
            return Err(ConfigError::Validation(format!(
                "{} must contain the {} placeholder",
                name, PARENT_ID_PLACEHOLDER
            )));
        }

        let probe = template.replace(PARENT_ID_PLACEHOLDER, "0");
        Url::parse(&probe)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {}: {}", name, e)))?;
    }

    if let Some(page) = &config.search_page_url {
        Url::parse(&page.replace("{keywords}", "probe"))
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid search_page_url: {}", e)))?;
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_credential_config(config: &CredentialConfig) -> Result<(), ConfigError> {
    if config.credential_ttl_secs < 60 {
        return Err(ConfigError::Validation(format!(
            "credential_ttl_secs must be >= 60, got {}",
            config.credential_ttl_secs
        )));
    }

    if config.pool_max_size < 1 {
        return Err(ConfigError::Validation(
            "pool_max_size must be >= 1".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&config.max_failure_rate) {
        return Err(ConfigError::Validation(format!(
            "max_failure_rate must be within 0.0..=1.0, got {}",
            config.max_failure_rate
        )));
    }

    Ok(())
}

fn validate_health_config(config: &HealthConfig) -> Result<(), ConfigError> {
    if config.health_check_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "health_check_interval_secs must be >= 1".to_string(),
        ));
    }

    if config.recent_window < 1 || config.history_size < 1 {
        return Err(ConfigError::Validation(
            "recent_window and history_size must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "backoff_multiplier must be >= 1.0, got {}",
            config.backoff_multiplier
        )));
    }

    if config.initial_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "initial_delay_ms ({}) must not exceed max_delay_ms ({})",
            config.initial_delay_ms, config.max_delay_ms
        )));
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}
