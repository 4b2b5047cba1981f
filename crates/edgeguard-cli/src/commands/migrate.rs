use anyhow::{Context, Result};

use edgeguard_auth_postgres::PostgresAuthStorage;

use crate::cli::MigrateArgs;
use crate::output::print_success;

pub async fn run(args: &MigrateArgs) -> Result<()> {
    let target = mask_password(&args.database_url);
    tracing::info!(url = %target, "Connecting to PostgreSQL");

    let storage = PostgresAuthStorage::connect(&args.database_url)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    storage
        .migrate()
        .await
        .context("failed to create tables")?;

    print_success(&format!("Schema is up to date on {target}"));
    Ok(())
}

/// Masks the password in a database URL for display.
///
/// The userinfo ends at the last `@` of the authority, so a password that
/// itself contains `@` is masked whole.
fn mask_password(url: &str) -> String {
    let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
    let rest = &url[scheme_end..];
    let authority = &rest[..rest.find('/').unwrap_or(rest.len())];

    if let Some(at_pos) = authority.rfind('@')
        && let Some(colon_pos) = authority[..at_pos].find(':')
    {
        return format!(
            "{}:****{}",
            &url[..scheme_end + colon_pos],
            &url[scheme_end + at_pos..]
        );
    }
    url.to_string()
}
