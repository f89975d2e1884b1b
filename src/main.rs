use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nailbliss::auth::{AuthMachine, FilePreferenceStore, PreferenceStore, RetryOutcome};
use nailbliss::backend::{AuthBackend, Role, SignUpAttrs, User, VisitStore};
use nailbliss::config::Config;
use nailbliss::error::ClassifiedError;
use nailbliss::integrations::SupabaseClient;
use nailbliss::loyalty;
use nailbliss::qr::{CheckIn, Clock, QrDisplay, QrProtocol, Signer, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nailbliss")]
#[command(version, about = "NailBliss loyalty check-in client", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.nailbliss/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password
    Login {
        email: String,
        /// Password; prompted for when omitted
        #[arg(long)]
        password: Option<String>,
        /// Do not restore this session on the next run
        #[arg(long)]
        no_remember: bool,
    },
    /// Create an account
    Signup {
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long, value_enum, default_value_t = RoleArg::Customer)]
        role: RoleArg,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        no_remember: bool,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in user and loyalty progress
    Whoami,
    /// Password management
    Password {
        #[command(subcommand)]
        action: PasswordCommand,
    },
    /// Customer QR code
    Qr {
        #[command(subcommand)]
        action: QrCommand,
    },
    /// Staff: validate a scanned payload and optionally record the visit
    Scan {
        /// Raw payload; `-` reads it from stdin
        payload: String,
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PasswordCommand {
    /// Email a reset link
    Reset { email: String },
    /// Set a new password for the signed-in user
    Update {
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QrCommand {
    /// Display a rotating code until Ctrl-C
    Show,
    /// Check a payload offline
    Verify {
        payload: String,
        /// Validate as of this instant instead of now
        #[arg(long)]
        at_ms: Option<i64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Customer,
    Staff,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Customer => Role::Customer,
            RoleArg::Staff => Role::Staff,
        }
    }
}

// ── Wiring ───────────────────────────────────────────────────────

struct App {
    client: Arc<SupabaseClient>,
    machine: Arc<AuthMachine>,
    protocol: Arc<QrProtocol>,
}

impl App {
    fn connect(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        let client = Arc::new(
            SupabaseClient::new(config.supabase.clone(), Some(&data_dir))
                .context("Supabase is not configured (set SUPABASE_URL and SUPABASE_ANON_KEY)")?,
        );
        let preference: Arc<dyn PreferenceStore> = Arc::new(FilePreferenceStore::new(&data_dir));
        let machine = AuthMachine::new(
            Arc::clone(&client) as Arc<dyn AuthBackend>,
            preference,
            config.auth.clone(),
        );
        Ok(Self {
            client,
            machine,
            protocol: protocol(config),
        })
    }

    /// Restore the session, spending the retry budget on failures.
    async fn current_user(&self) -> Result<Option<User>> {
        let mut last = match self.machine.bootstrap().await {
            Ok(user) => return Ok(user),
            Err(e) => e,
        };
        loop {
            eprintln!("{} Retrying...", last.user_message());
            match self.machine.retry().await {
                RetryOutcome::Recovered(user) => return Ok(user),
                RetryOutcome::Failed(e) => last = e,
                RetryOutcome::Exhausted => bail!(
                    "Could not restore your session, so it was cleared. Run `nailbliss login` again."
                ),
            }
        }
    }

    async fn require_user(&self) -> Result<User> {
        match self.current_user().await? {
            Some(user) => Ok(user),
            None => bail!("Not signed in. Run `nailbliss login` first."),
        }
    }
}

fn protocol(config: &Config) -> Arc<QrProtocol> {
    let signer = Signer::from_secret(config.qr.signing_secret.as_deref());
    if !signer.is_keyed() {
        tracing::warn!(
            "QR codes use the legacy unkeyed signature; set qr.signing_secret to require a shared secret"
        );
    }
    Arc::new(QrProtocol::new(signer, config.qr_window()))
}

/// Log the technical detail, surface the friendly message.
fn user_facing(e: ClassifiedError) -> anyhow::Error {
    tracing::debug!(error = %e, "Backend call failed");
    anyhow::anyhow!(e.user_message())
}

fn read_secret(arg: Option<String>, prompt: &str) -> Result<String> {
    if let Some(value) = arg {
        return Ok(value);
    }
    dialoguer::Password::new()
        .with_prompt(prompt)
        .interact()
        .with_context(|| format!("Failed to read {}", prompt.to_lowercase()))
}

fn print_user(user: &User) {
    println!("{} <{}> ({})", user.full_name, user.email, user.role);
    if user.role == Role::Customer {
        println!(
            "Points: {} ({} of {} on this card, {} visits to next reward)",
            user.current_points,
            loyalty::progress(user.current_points),
            loyalty::POINTS_PER_REWARD,
            loyalty::visits_until_reward(user.current_points),
        );
        if loyalty::reward_ready(user.current_points) {
            println!("A reward is ready to redeem!");
        }
        println!("Total visits: {}", user.total_visits);
    }
}

// ── Commands ─────────────────────────────────────────────────────

async fn show_qr(app: &App) -> Result<()> {
    let user = app.require_user().await?;
    let _listener = app.machine.listen_auth_changes();
    let mut sessions = app.machine.subscribe();

    let mut display = QrDisplay::spawn(
        user.id.clone(),
        Arc::clone(&app.protocol),
        Arc::new(SystemClock),
    );
    let mut shown = display.current();
    println!("{}", shown.token.to_payload());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = sessions.changed() => {
                if changed.is_err() || sessions.borrow_and_update().user.is_none() {
                    eprintln!("\nSigned out, closing QR code.");
                    break;
                }
            }
            frame = display.next_frame() => {
                let Some(frame) = frame else { break };
                if frame.token != shown.token {
                    eprintln!();
                    println!("{}", frame.token.to_payload());
                }
                eprint!("\rRefreshes in {:>2}s", frame.seconds_remaining);
                shown = frame;
            }
        }
    }

    display.close().await;
    eprintln!();
    Ok(())
}

fn verify_qr(protocol: &QrProtocol, payload: &str, at_ms: Option<i64>) -> Result<()> {
    let token = CheckIn::parse_payload(payload)?;
    let now_ms = at_ms.unwrap_or_else(|| SystemClock.now_ms());
    match protocol.check_token(&token, now_ms) {
        Ok(()) => {
            println!("Valid code for subject {}", token.subject_id);
            Ok(())
        }
        Err(rejection) => bail!("{rejection}"),
    }
}

async fn scan(app: &App, payload: &str, confirm: bool) -> Result<()> {
    let staff = app.require_user().await?;
    if staff.role != Role::Staff {
        bail!("Only staff accounts can scan QR codes");
    }

    let payload = if payload == "-" {
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("Failed to read payload from stdin")?;
        line
    } else {
        payload.to_string()
    };

    let checkin = CheckIn::new(
        Arc::clone(&app.client) as Arc<dyn VisitStore>,
        Arc::clone(&app.protocol),
        Arc::new(SystemClock),
    );
    let accepted = checkin.scan(&payload).await?;
    print_user(&accepted.customer);

    if !confirm {
        println!("Run again with --confirm to add a point.");
        return Ok(());
    }

    let receipt = checkin.confirm(&accepted, &staff.id).await?;
    println!(
        "Point added for {}. Balance: {} ({} visits)",
        receipt.full_name, receipt.points.current_points, receipt.points.total_visits
    );
    if receipt.reward_ready {
        println!("Card complete: reward ready!");
    }
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    // Offline command: no backend needed.
    if let Command::Qr {
        action: QrCommand::Verify { payload, at_ms },
    } = &cli.command
    {
        return verify_qr(&protocol(&config), payload, *at_ms);
    }

    let app = App::connect(&config)?;
    let result = match cli.command {
        Command::Login {
            email,
            password,
            no_remember,
        } => {
            let password = read_secret(password, "Password")?;
            let user = app
                .machine
                .sign_in(&email, &password, !no_remember)
                .await
                .map_err(user_facing)?;
            println!("Signed in.");
            print_user(&user);
            Ok(())
        }
        Command::Signup {
            email,
            full_name,
            role,
            password,
            no_remember,
        } => {
            let password = read_secret(password, "Password")?;
            let attrs = SignUpAttrs {
                full_name,
                role: role.into(),
            };
            let user = app
                .machine
                .sign_up(&email, &password, &attrs, !no_remember)
                .await
                .map_err(user_facing)?;
            println!("Account created.");
            print_user(&user);
            Ok(())
        }
        Command::Logout => {
            app.machine.sign_out().await.map_err(user_facing)?;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            match app.current_user().await? {
                Some(user) => print_user(&user),
                None => println!("Not signed in."),
            }
            Ok(())
        }
        Command::Password {
            action: PasswordCommand::Reset { email },
        } => {
            app.machine.reset_password(&email).await.map_err(user_facing)?;
            println!("If {email} has an account, a reset link is on its way.");
            Ok(())
        }
        Command::Password {
            action: PasswordCommand::Update { password },
        } => {
            app.require_user().await?;
            let password = read_secret(password, "New password")?;
            app.machine
                .update_password(&password)
                .await
                .map_err(user_facing)?;
            println!("Password updated.");
            Ok(())
        }
        Command::Qr {
            action: QrCommand::Show,
        } => show_qr(&app).await,
        Command::Qr {
            action: QrCommand::Verify { payload, at_ms },
        } => verify_qr(&app.protocol, &payload, at_ms),
        Command::Scan { payload, confirm } => scan(&app, &payload, confirm).await,
    };

    app.machine.teardown();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nailbliss=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)?;
    tracing::debug!(path = %config_path.display(), "Config loaded");

    run(cli, config).await
}
