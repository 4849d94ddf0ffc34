use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dou_core::api::{ApiError, ApiRequest};
use dou_core::auth::{
    AuthEvent, CredentialStore, FileCredentialStore, LoginRequest, RegisterRequest,
};
use dou_core::config::ClientConfig;
use dou_core::DouClient;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DOU_LOG";
/// Pause before reacting to a forced logout so in-flight output settles first.
const EXPIRED_NOTICE_DELAY: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(author, version, about = "Dou API terminal client")]
struct Cli {
    /// Override the API base URL (defaults to DOU_API_URL)
    #[arg(long = "api-url", global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Raw API requests through the authenticated client
    #[command(subcommand)]
    Api(ApiCommand),
    /// Poll an endpoint and report authentication events
    Watch(WatchArgs),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in and store the issued tokens
    Login(LoginArgs),
    /// Create an account and store the issued tokens
    Register(RegisterArgs),
    /// Forget stored credentials
    Logout,
    /// Show whether credentials are stored and when the access token expires
    Status,
    /// Exchange the refresh token for a new access token now
    Refresh,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    username: String,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ApiCommand {
    /// GET a path relative to the API base URL
    Get(GetArgs),
    /// POST a JSON body
    Post(BodyArgs),
    /// PATCH a JSON body
    Patch(BodyArgs),
    /// DELETE a resource
    Delete(PathArgs),
}

#[derive(Args, Debug)]
struct GetArgs {
    path: String,
    /// Follow `next` links and print every item of a paginated list
    #[arg(long)]
    all: bool,
}

#[derive(Args, Debug)]
struct BodyArgs {
    path: String,
    /// JSON request body
    #[arg(long)]
    data: String,
}

#[derive(Args, Debug)]
struct PathArgs {
    path: String,
}

#[derive(Args, Debug)]
struct WatchArgs {
    path: String,
    /// Seconds between polls
    #[arg(long, default_value_t = 30)]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let client = build_client(cli.api_url.as_deref())?;

    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(&client, args).await?,
            AuthCommand::Register(args) => auth_register(&client, args).await?,
            AuthCommand::Logout => auth_logout(&client)?,
            AuthCommand::Status => auth_status(&client)?,
            AuthCommand::Refresh => auth_refresh(&client).await?,
        },
        Commands::Api(cmd) => match cmd {
            ApiCommand::Get(args) => api_get(&client, args).await?,
            ApiCommand::Post(args) => api_send(&client, ApiRequest::post(&args.path), args).await?,
            ApiCommand::Patch(args) => {
                api_send(&client, ApiRequest::patch(&args.path), args).await?
            }
            ApiCommand::Delete(args) => {
                client
                    .api
                    .delete(&args.path)
                    .await
                    .map_err(describe_api_error)?;
                println!("Deleted {}.", args.path);
            }
        },
        Commands::Watch(args) => watch(&client, args).await?,
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn build_client(api_url: Option<&str>) -> Result<DouClient> {
    let mut config = ClientConfig::from_env().context("invalid API configuration")?;
    if let Some(url) = api_url {
        config.api_url = ClientConfig::parse(url).context("invalid --api-url")?.api_url;
    }
    let store: Arc<dyn CredentialStore> = Arc::new(
        FileCredentialStore::with_default_locator()
            .context("unable to initialise credential store")?,
    );
    DouClient::new(config, store).context("failed to build API client")
}

async fn auth_login(client: &DouClient, args: LoginArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password: ").await?,
    };
    client
        .session
        .login(&LoginRequest {
            username: args.username.clone(),
            password,
        })
        .await
        .map_err(describe_api_error)?;
    println!("Logged in as {}.", args.username);
    print_expiry(client)?;
    Ok(())
}

async fn auth_register(client: &DouClient, args: RegisterArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Choose a password: ").await?,
    };
    client
        .session
        .register(&RegisterRequest {
            username: args.username.clone(),
            email: args.email,
            password,
        })
        .await
        .map_err(describe_api_error)?;
    println!("Account {} created and logged in.", args.username);
    Ok(())
}

fn auth_logout(client: &DouClient) -> Result<()> {
    client
        .session
        .logout()
        .context("failed to remove stored credentials")?;
    println!("Stored credentials deleted.");
    Ok(())
}

fn auth_status(client: &DouClient) -> Result<()> {
    if !client.session.is_authenticated()? {
        println!("Not logged in.");
        return Ok(());
    }
    println!("Logged in.");
    print_expiry(client)
}

async fn auth_refresh(client: &DouClient) -> Result<()> {
    client
        .api
        .coordinator()
        .refresh()
        .await
        .context("token refresh failed")?;
    println!("Access token refreshed.");
    print_expiry(client)
}

fn print_expiry(client: &DouClient) -> Result<()> {
    if let Some(expiry) = client.session.token_expiry()? {
        println!("Access token expires at {} (UTC).", expiry);
    }
    Ok(())
}

async fn api_get(client: &DouClient, args: GetArgs) -> Result<()> {
    let value = if args.all {
        Value::Array(
            client
                .api
                .get_all::<Value>(&args.path)
                .await
                .map_err(describe_api_error)?,
        )
    } else {
        client
            .api
            .get_json::<Value>(&args.path)
            .await
            .map_err(describe_api_error)?
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn api_send(client: &DouClient, request: ApiRequest, args: BodyArgs) -> Result<()> {
    let body: Value = serde_json::from_str(&args.data).context("--data must be valid JSON")?;
    let response = client
        .api
        .request(request.with_json(&body)?)
        .await
        .map_err(describe_api_error)?;
    let value: Value = response.json()?;
    if value.is_null() {
        println!("{}", response.status());
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

async fn watch(client: &DouClient, args: WatchArgs) -> Result<()> {
    if args.interval == 0 {
        bail!("--interval must be at least one second");
    }
    let mut events = client.events.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.api.get_json::<Value>(&args.path).await {
                    Ok(value) => println!("{}", serde_json::to_string(&value)?),
                    Err(err) => eprintln!("{}", err.user_message()),
                }
            }
            event = events.recv() => match event {
                Ok(AuthEvent::TokenExpired) => {
                    tokio::time::sleep(EXPIRED_NOTICE_DELAY).await;
                    bail!("session expired; run `dou auth login` to sign in again");
                }
                Ok(event) => tracing::info!(%event, "auth event"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "missed auth events"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn describe_api_error(err: ApiError) -> anyhow::Error {
    let message = err.user_message();
    anyhow!(err).context(message)
}

async fn prompt(label: &'static str) -> Result<String> {
    task::spawn_blocking(move || {
        use std::io::{self, Write};
        print!("{label}");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok::<_, io::Error>(input.trim().to_owned())
    })
    .await
    .map_err(|_| anyhow!("input cancelled"))?
    .context("failed to read from stdin")
}
