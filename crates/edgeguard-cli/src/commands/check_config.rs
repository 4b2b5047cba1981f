use anyhow::{Context, Result};

use edgeguard_auth::{AuthConfig, RateLimitedOperation};
use humantime_serde::re::humantime::format_duration;

use crate::cli::CheckConfigArgs;
use crate::output::{print_field, print_success, print_warning};

pub fn run(args: &CheckConfigArgs) -> Result<()> {
    let config = AuthConfig::load(args.path.as_deref()).context("configuration is invalid")?;
    config
        .secrets
        .resolve()
        .context("configuration is missing secrets")?;

    match &args.path {
        Some(path) => print_success(&format!("{} is valid", path.display())),
        None => print_success("environment configuration is valid"),
    }

    for (name, value) in summarize(&config) {
        print_field(&name, value);
    }
    for warning in warnings(&config) {
        print_warning(warning);
    }
    Ok(())
}

/// Non-secret settings worth showing after a successful check.
fn summarize(config: &AuthConfig) -> Vec<(String, String)> {
    let mut fields = vec![
        (
            "password length".to_string(),
            format!("{}..={}", config.password.min_length, config.password.max_length),
        ),
        (
            "argon2id".to_string(),
            format!(
                "m={} KiB, t={}, p={}",
                config.password.memory_kib, config.password.iterations, config.password.parallelism
            ),
        ),
        (
            "session lifetime".to_string(),
            format_duration(config.session.session_lifetime).to_string(),
        ),
        (
            "api token lifetime".to_string(),
            format_duration(config.session.api_token_lifetime).to_string(),
        ),
        (
            "cache".to_string(),
            if config.cache.enabled {
                format!("ttl {}", format_duration(config.cache.ttl))
            } else {
                "disabled".to_string()
            },
        ),
    ];

    if config.rate_limiting.enabled {
        for operation in RateLimitedOperation::ALL {
            let rule = config.rate_limiting.rule_for(operation);
            fields.push((
                format!("rate limit {}", operation.as_str()),
                format!("{} per {}", rule.requests, format_duration(rule.window)),
            ));
        }
    } else {
        fields.push(("rate limit".to_string(), "disabled".to_string()));
    }

    fields
}

fn warnings(config: &AuthConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.secrets.admin_secret.is_none() {
        warnings.push("admin bypass is disabled (no secrets.admin_secret)");
    }
    if !config.rate_limiting.enabled {
        warnings.push("rate limiting is disabled");
    }
    if !config.session.store_encrypted_token {
        warnings.push("API tokens cannot be revealed (session.store_encrypted_token = false)");
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_valid_file_passes() {
        let file = write_config(&format!(
            r#"
            [secrets]
            root_key = "{}"
            lookup_key = "{}"

            [rate_limiting.rules.login]
            requests = 10
            window = "1m"
            "#,
            "ab".repeat(32),
            "cd".repeat(32),
        ));

        let args = CheckConfigArgs {
            path: Some(file.path().to_path_buf()),
        };
        run(&args).unwrap();

        let config = AuthConfig::load(Some(file.path())).unwrap();
        let fields = summarize(&config);
        assert!(fields.contains(&("rate limit login".to_string(), "10 per 1m".to_string())));
        assert_eq!(warnings(&config).len(), 1);
    }

    #[test]
    fn test_missing_secrets_fail() {
        let file = write_config("[cache]\nttl = \"30s\"\n");
        let args = CheckConfigArgs {
            path: Some(file.path().to_path_buf()),
        };
        assert!(run(&args).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let args = CheckConfigArgs {
            path: Some(PathBuf::from("/nonexistent/edgeguard.toml")),
        };
        let err = run(&args).unwrap_err();
        assert!(format!("{err:#}").contains("config file not found"));
    }
}
