use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sessionward_core::{ApiClient, Config, HttpAuthApi, SessionManager, SessionPhase};
use tracing::warn;

use crate::{Cli, Command};

/// Used when neither the flag, the environment nor the config name an API.
const DEFAULT_API_URL: &str = "http://localhost:8080/api";

struct Connection {
    config: Config,
    session: SessionManager,
    auth: HttpAuthApi,
}

fn connect(api_url: Option<String>) -> Result<Connection> {
    let config = Config::load().context("Failed to load config")?;
    let api_url = api_url
        .or_else(|| config.api_base_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let auth = HttpAuthApi::new(api_url, config.request_timeout())
        .context("Failed to build HTTP client")?;
    let storage = config.storage.open().context("Failed to open session storage")?;
    let session = SessionManager::restore(Arc::new(auth.clone()), storage, config.session_options());

    Ok(Connection {
        config,
        session,
        auth,
    })
}

pub async fn run(cli: Cli) -> Result<()> {
    let ctx = connect(cli.api_url)?;

    match cli.command {
        Command::Login { identifier } => login(ctx, identifier).await,
        Command::Status => {
            print_status(&ctx.session)?;
            Ok(())
        }
        Command::Refresh => {
            ctx.session.refresh().await.context("Renewal failed, session cleared")?;
            print_status(&ctx.session)
        }
        Command::Logout => {
            ctx.session.logout().await;
            eprintln!("Logged out");
            Ok(())
        }
        Command::OauthCallback { provider } => {
            ctx.session
                .oauth_callback_observed(&provider)
                .await
                .with_context(|| format!("Could not materialize a session after {} sign-in", provider))?;
            print_status(&ctx.session)
        }
        Command::Watch => watch(&ctx.session).await,
        Command::Fetch { path } => {
            let api = ApiClient::new(ctx.auth.client().clone(), ctx.auth.base_url(), ctx.session.clone());
            let body: serde_json::Value = api.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}

async fn login(mut ctx: Connection, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier.or_else(|| ctx.config.last_identifier.clone()) {
        Some(identifier) => identifier,
        None => bail!("No identifier given; pass --identifier"),
    };
    let secret = rpassword::prompt_password(format!("Password for {}: ", identifier))
        .context("Failed to read password")?;

    let phase = ctx.session.login(&identifier, &secret).await?;

    ctx.config.last_identifier = Some(identifier);
    if let Err(e) = ctx.config.save() {
        warn!(error = %e, "Failed to save config");
    }

    match phase {
        SessionPhase::PendingVerification => {
            eprintln!("Login accepted; complete the verification step to finish signing in")
        }
        _ => eprintln!("Logged in"),
    }
    print_status(&ctx.session)
}

fn print_status(session: &SessionManager) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    if let Some(due_at) = session.renewal_due_at() {
        let minutes = (due_at - Utc::now()).num_minutes().max(0);
        eprintln!("Next renewal in {}m ({})", minutes, due_at.format("%H:%M:%S"));
    } else if session.is_authenticated() {
        eprintln!("Credential expiry unknown; renewing only when the server rejects it");
    }
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    if !session.is_authenticated() {
        bail!("Not logged in");
    }
    print_status(session)?;

    let mut changes = session.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = changes.borrow_and_update().clone();
                print_status(session)?;
                if !state.is_authenticated() {
                    bail!("Session ended");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopped watching; session left in place");
                return Ok(());
            }
        }
    }
}
