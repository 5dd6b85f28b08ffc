#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod auth;
pub mod cardtoken;
pub mod config;
pub mod error;
pub mod gateway;
pub mod realtime;
pub mod store;

use anyhow::{Context, Result};
use std::sync::Arc;

/// Open the database and assemble the card lifecycle from a validated config.
pub fn build_lifecycle(config: &config::Config) -> Result<Arc<auth::CardLifecycle<store::SqliteStore>>> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = store::SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    tracing::info!("Database ready at {}", db_path.display());

    let issuer = auth::SessionIssuer::new(config.session_secret(), config.session_ttl())?;
    let passwords = auth::Argon2Scheme::new(config.password.memory_kib, config.password.iterations)?;

    Ok(Arc::new(auth::CardLifecycle::new(
        cardtoken::TokenCodec::new(config.card_token_secret()),
        issuer,
        Arc::new(passwords),
        Arc::new(store),
        config.pair_ttl(),
    )))
}
