use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{OptionExt, eyre};
use fogwatch_client::auth::{LocalAuthenticator, SessionTracker};
use fogwatch_client::backend::SessionFilter;
use fogwatch_client::backend::memory::InMemoryBackend;
use fogwatch_client::backend::rest::RestBackend;
use fogwatch_client::backend::sqlite::SqliteBackend;
use fogwatch_client::{
    Authenticator, Backend, CredentialSource, Credentials, Dashboard, SessionStore,
};
use fogwatch_core::SensorId;
use fogwatch_core::stats::{self, DashboardStats, DetectionSummary};
use fogwatch_dashboard::{
    AppState, api,
    config::{BackendConfig, Config, OperatorConfig},
    seed,
};
use jiff::tz::TimeZone;
use jiff::{Timestamp, Zoned};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fogwatch")]
#[command(about = "Mosquito sensor monitoring dashboard")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fogwatch.toml")]
    config: PathBuf,

    /// Operator email, overrides the configuration
    #[arg(long, global = true)]
    email: Option<String>,

    /// Operator password, overrides the configuration
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and serve the HTTP API (default)
    Serve,
    /// Print the dashboard counters
    Summary,
    /// List sensors, most recently updated first
    Sensors {
        /// Only sensors at high mosquito risk
        #[arg(long)]
        high_risk: bool,
    },
    /// List detections, newest first
    Detections,
    /// List fogging logs, most recent first
    FoggingLogs,
    /// Record a fogging treatment at a sensor
    LogFogging {
        sensor_id: String,
        /// Treatment date, defaults to today
        #[arg(long)]
        date: Option<jiff::civil::Date>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List login sessions, most recent first
    Sessions {
        #[arg(long)]
        active: Option<bool>,
        /// Case-insensitive part of the email
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        from: Option<Timestamp>,
        #[arg(long)]
        to: Option<Timestamp>,
    },
    /// Register a new user
    SignUp { email: String, password: String },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        "tracing=info,fogwatch=info,fogwatch_dashboard=info,fogwatch_client=info".to_owned()
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let operator = match (cli.email, cli.password, config.operator.clone()) {
        (Some(email), Some(password), _) => Some(OperatorConfig { email, password }),
        (Some(email), None, Some(configured)) => Some(OperatorConfig {
            email,
            password: configured.password,
        }),
        (None, Some(password), Some(configured)) => Some(OperatorConfig {
            email: configured.email,
            password,
        }),
        (_, _, configured) => configured,
    };

    let time_zone = match &config.server.time_zone {
        Some(name) => TimeZone::get(name)?,
        None => TimeZone::system(),
    };

    let settings = Settings {
        command: cli.command.unwrap_or(Command::Serve),
        operator,
        time_zone,
        config,
    };

    match settings.config.backend.clone() {
        BackendConfig::Memory { seed_demo } => {
            info!(seed_demo, "Using in-memory backend");
            let backend = InMemoryBackend::new();
            if seed_demo {
                seed::demo(&backend).await;
            }
            let auth = local_authenticator(&settings.config);
            run(settings, backend, auth).await?;
        }
        BackendConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite backend");
            let backend = SqliteBackend::new(&path).await?;
            let auth = local_authenticator(&settings.config);
            run(settings, backend, auth).await?;
        }
        BackendConfig::Rest { url, anon_key } => {
            info!(url = %url, "Using hosted backend");
            let backend = RestBackend::new(&url, &anon_key)?;
            run(settings, backend.clone(), backend).await?;
        }
    }

    Ok(())
}

struct Settings {
    command: Command,
    operator: Option<OperatorConfig>,
    time_zone: TimeZone,
    config: Config,
}

impl Settings {
    fn now(&self) -> Zoned {
        Zoned::now().with_time_zone(self.time_zone.clone())
    }
}

fn local_authenticator(config: &Config) -> LocalAuthenticator {
    LocalAuthenticator::new(
        config
            .users
            .iter()
            .map(|user| (user.email.as_str(), user.password.as_str())),
    )
}

async fn run<B, A>(settings: Settings, backend: B, auth: A) -> color_eyre::Result<()>
where
    B: Backend,
    A: Authenticator,
{
    let backend = Arc::new(backend);
    let tracker = SessionTracker::new(Arc::new(auth), Arc::clone(&backend));

    if let Command::SignUp { email, password } = &settings.command {
        let user = tracker.sign_up(email, password).await?;
        println!("registered {} ({})", user.email, user.id);
        return Ok(());
    }

    let operator = settings
        .operator
        .as_ref()
        .ok_or_eyre("no operator credentials configured")?;
    let session = tracker.sign_in(&operator.email, &operator.password).await?;

    let result = match &settings.command {
        Command::Serve => serve(&settings, backend, Arc::new(tracker.clone())).await,
        command => one_shot(&settings, command, backend, &session.credentials()).await,
    };

    if let Err(e) = tracker.sign_out().await {
        warn!(error = %e, "Failed to sign out");
    }

    result
}

async fn serve<B: Backend>(
    settings: &Settings,
    backend: Arc<B>,
    auth: Arc<dyn CredentialSource>,
) -> color_eyre::Result<()> {
    let credentials = auth.credentials().await;
    let dashboard = Dashboard::new(Arc::clone(&backend));
    dashboard.initialize(&credentials).await;

    let sessions = SessionStore::new(Arc::clone(&backend));
    if let Err(e) = sessions.fetch(&credentials).await {
        warn!(error = %e, "Initial session fetch failed");
    }

    let cancel = CancellationToken::new();
    let listener_task = backend.listen(Arc::clone(&auth), cancel.clone());
    let watcher = sessions.watch(Arc::clone(&auth), cancel.clone());

    let state = AppState::new(dashboard, sessions, auth, settings.time_zone.clone());
    let app = api::router().with_state(state);

    let http_addr = settings.config.server.http_addr;
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_clone = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    cancel.cancel();
    if let Err(e) = watcher.await {
        warn!(error = %e, "Session watcher panicked");
    }
    if let Some(task) = listener_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "Realtime listener panicked");
    }

    Ok(())
}

async fn one_shot<B: Backend>(
    settings: &Settings,
    command: &Command,
    backend: Arc<B>,
    credentials: &Credentials,
) -> color_eyre::Result<()> {
    let dashboard = Dashboard::new(Arc::clone(&backend));

    match command {
        Command::Summary => {
            dashboard.initialize(credentials).await;
            let snapshot = dashboard.snapshot(&settings.now()).await;
            if let Some(e) = &snapshot.status.error {
                return Err(eyre!("{e}"));
            }

            let DashboardStats {
                active_sensors,
                alert_locations,
                detections_today,
            } = snapshot.stats;
            println!("Active sensors:      {active_sensors}");
            println!("Alert locations:     {alert_locations}");
            println!("Detections today:    {detections_today}");
            for sensor in snapshot.high_risk_sensors() {
                println!("  high risk: {} ({})", sensor.name, sensor.location);
            }
        }
        Command::Sensors { high_risk } => {
            let sensors = dashboard.fetch_sensors(credentials).await?;
            let sensors: Vec<_> = if *high_risk {
                stats::high_risk_sensors(&sensors).cloned().collect()
            } else {
                sensors
            };
            print_json(&sensors)?;
        }
        Command::Detections => {
            let detections = dashboard.fetch_detections(credentials).await?;
            let summaries: Vec<_> = detections.iter().map(DetectionSummary::from).collect();
            print_json(&summaries)?;
        }
        Command::FoggingLogs => {
            print_json(&dashboard.fetch_fogging_logs(credentials).await?)?;
        }
        Command::LogFogging {
            sensor_id,
            date,
            notes,
        } => {
            let date = date.unwrap_or_else(|| settings.now().date());
            dashboard
                .log_fogging(
                    credentials,
                    SensorId::from(sensor_id.as_str()),
                    date,
                    notes.as_deref(),
                )
                .await?;
            println!("logged fogging at {sensor_id} on {date}");
        }
        Command::Sessions {
            active,
            email,
            from,
            to,
        } => {
            let sessions = SessionStore::new(backend);
            sessions
                .set_filter(SessionFilter {
                    active: *active,
                    email: email.clone(),
                    from: *from,
                    to: *to,
                })
                .await;
            sessions.fetch(credentials).await?;
            print_json(&sessions.views(Timestamp::now()).await)?;
        }
        Command::Serve | Command::SignUp { .. } => {
            return Err(eyre!("not a one-shot command"));
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
