//! Command execution

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use common::{Clock, Config, Secret, SystemClock};
use github_auth::{Authenticator, DeviceFlowSession, TokenState, TokenStore, open_backend};
use github_client::{GitHubClient, RetryPolicy, build_http_client};
use reqwest::Method;
use tracing::{debug, info, warn};

use crate::cli::Command;

/// Everything a command needs, wired once per process.
pub struct Session {
    config: Config,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    auth: Arc<Authenticator>,
}

impl Session {
    pub async fn open(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let http = build_http_client(&config.api.user_agent)?;

        let backend = open_backend(&config.storage, config.passphrase.as_ref())
            .context("failed to open token storage")?;
        let store = TokenStore::open(backend, clock.clone())
            .await
            .context("failed to load tokens")?;
        let store = Arc::new(store);

        let auth = Authenticator::new(
            store,
            http.clone(),
            &config.oauth,
            clock.clone(),
            RetryPolicy::from_config(&config.api),
        )
        .with_env_token(config.token.clone());

        Ok(Self {
            config,
            clock,
            http,
            auth: Arc::new(auth),
        })
    }

    fn client(&self) -> Result<GitHubClient> {
        Ok(GitHubClient::new(
            &self.config.api,
            self.http.clone(),
            self.auth.clone(),
            self.clock.clone(),
        )?)
    }

    pub async fn run(&self, command: Command) -> Result<ExitCode> {
        match command {
            Command::Login { scopes } => self.login(scopes).await,
            Command::Logout => {
                if self.auth.logout().await? {
                    println!("Logged out of {}", self.auth.host());
                } else {
                    println!("Not logged in");
                }
                Ok(ExitCode::SUCCESS)
            }
            Command::Status => self.status().await,
            Command::Tokens { json } => self.tokens(json).await,
            Command::Switch { handle } => {
                if self.auth.store().set_active(&handle).await? {
                    println!("Switched to token {handle}");
                    Ok(ExitCode::SUCCESS)
                } else {
                    eprintln!("no stored token starts with {handle}");
                    Ok(ExitCode::FAILURE)
                }
            }
            Command::Delete { handle } => {
                if self.auth.store().delete(&handle).await? {
                    println!("Deleted tokens starting with {handle}");
                    Ok(ExitCode::SUCCESS)
                } else {
                    eprintln!("no stored token starts with {handle}");
                    Ok(ExitCode::FAILURE)
                }
            }
            Command::Import { host, scopes } => self.import(host, scopes).await,
            Command::Api {
                path,
                method,
                data,
                paginate,
            } => self.api(&path, &method, data.as_deref(), paginate).await,
        }
    }

    async fn login(&self, scopes: Option<Vec<String>>) -> Result<ExitCode> {
        if self.auth.uses_env_token() {
            warn!("GH_TOKEN is set and takes precedence over stored tokens");
        }

        let login = self.auth.login(scopes.as_deref(), print_prompt);
        tokio::pin!(login);
        let result = tokio::select! {
            result = &mut login => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, cancelling login");
                self.auth.cancel_login().await;
                (&mut login).await
            }
        };

        let record = result?;
        println!(
            "Logged in to {} (token {}..., scopes: {})",
            record.host,
            record.prefix(),
            if record.scope.is_empty() {
                "none".to_string()
            } else {
                record.scope.join(", ")
            }
        );
        Ok(ExitCode::SUCCESS)
    }

    async fn status(&self) -> Result<ExitCode> {
        let host = self.auth.host();
        if self.auth.uses_env_token() {
            println!("{host}: using token from GH_TOKEN");
            return Ok(ExitCode::SUCCESS);
        }

        let Some(record) = self.auth.store().active_record().await else {
            println!("{host}: not logged in (run `gh-session login`)");
            return Ok(ExitCode::FAILURE);
        };
        let now = self.clock.now();
        let state = record.state(now, github_auth::EXPIRY_WARNING);
        let expiry = match record.time_until_expiry(now) {
            None => "does not expire".to_string(),
            Some(left) if left.is_zero() => "expired".to_string(),
            Some(left) => format!("expires in {}", human_duration(left)),
        };
        println!(
            "{}: logged in with token {}... ({expiry}, storage: {})",
            record.host,
            record.prefix(),
            self.auth.store().backend_kind()
        );
        match state {
            TokenState::Valid => {}
            TokenState::ExpiringSoon if record.is_refreshable() => {
                println!("  token expires soon and will be refreshed on next use")
            }
            TokenState::ExpiringSoon => println!("  token expires soon; log in again"),
            TokenState::Expired if record.is_refreshable() => {
                println!("  token expired and will be refreshed on next use")
            }
            TokenState::Expired => {
                println!("  token expired; run `gh-session login`");
                return Ok(ExitCode::FAILURE);
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn tokens(&self, json: bool) -> Result<ExitCode> {
        let tokens = self.auth.store().list().await;
        if json {
            println!("{}", serde_json::to_string_pretty(&tokens)?);
            return Ok(ExitCode::SUCCESS);
        }
        if tokens.is_empty() {
            println!("no stored tokens");
            return Ok(ExitCode::SUCCESS);
        }
        for token in tokens {
            let marker = if token.active { "*" } else { " " };
            let status = if token.expired { " (expired)" } else { "" };
            println!(
                "{marker} {:<24} {}...  {}{status}",
                token.host,
                token.prefix,
                token.scope.join(",")
            );
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn import(&self, host: Option<String>, scopes: Vec<String>) -> Result<ExitCode> {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read token from stdin")?;
        let token = Secret::new(line.trim().to_string());
        if token.is_empty() {
            bail!("no token on stdin");
        }
        let id = self.auth.import_token(token, host.as_deref(), scopes).await?;
        println!("Imported token {}... for {}", id.prefix, id.host);
        Ok(ExitCode::SUCCESS)
    }

    async fn api(
        &self,
        path: &str,
        method: &str,
        data: Option<&str>,
        paginate: bool,
    ) -> Result<ExitCode> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method: {method}"))?;
        let body = data
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .context("--data must be valid JSON")?;

        let client = self.client()?;
        let mut response = client.request(method.clone(), path, None, body.as_ref()).await?;
        if !paginate || method != Method::GET {
            println!("{}", serde_json::to_string_pretty(&response.data)?);
            return Ok(ExitCode::SUCCESS);
        }

        let mut items = Vec::new();
        loop {
            match response.data {
                serde_json::Value::Array(page) => items.extend(page),
                other => {
                    println!("{}", serde_json::to_string_pretty(&other)?);
                    return Ok(ExitCode::SUCCESS);
                }
            }
            let Some(next) = response.pagination.next_url.take() else {
                break;
            };
            debug!(next = %next, "following next page");
            response = client.get(&next, None).await?;
        }
        println!("{}", serde_json::to_string_pretty(&items)?);
        Ok(ExitCode::SUCCESS)
    }
}

fn print_prompt(session: &DeviceFlowSession) {
    eprintln!("! First copy your one-time code: {}", session.user_code);
    match &session.verification_uri_complete {
        Some(uri) => eprintln!("Open this URL in your browser: {uri}"),
        None => eprintln!("Then open {} in your browser", session.verification_uri),
    }
    eprintln!("Waiting for authorization...");
}

/// `7h59m`, `4m10s`, `12s`.
fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
