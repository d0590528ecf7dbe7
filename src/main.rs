use std::process::ExitCode;
use std::sync::Arc;

use authgate::backend::supabase::SupabaseClient;
use authgate::config::DEFAULT_LOCALE_STORE_PATH;
use authgate::{Access, AuthConfig, AuthError, Locale, LocaleStore, Role, SessionMachine, SessionState, SignUp};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] authgate::ConfigError),
    #[error("backend setup failed: {0}")]
    Backend(#[from] authgate::BackendError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("locale store error: {0}")]
    Locale(#[from] authgate::locale::LocaleError),
    #[error("{0}")]
    InvalidLocale(#[from] authgate::locale::UnknownLocale),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "authgate", about = "Dashboard session and role checks against Supabase")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Login {
    #[arg(long, env = "AUTHGATE_EMAIL")]
    email: String,
    #[arg(long, env = "AUTHGATE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and print the session, profile, and route decision.
    SignIn {
        #[command(flatten)]
        login: Login,
        /// Roles the checked route admits; omit for authentication only.
        #[arg(long = "role")]
        roles: Vec<Role>,
    },
    /// Print the session restored from `SUPABASE_ACCESS_TOKEN` and the route decision.
    Session {
        #[arg(long = "role")]
        roles: Vec<Role>,
    },
    /// Create an account and its profile.
    SignUp {
        #[command(flatten)]
        login: Login,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Send a password reset mail.
    ResetPassword {
        #[arg(long)]
        email: String,
    },
    /// Sign in, then change the password.
    UpdatePassword {
        #[command(flatten)]
        login: Login,
        #[arg(long, env = "AUTHGATE_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Exit 0 only if the user may open a route admitting `--role`.
    Check {
        #[command(flatten)]
        login: Login,
        #[arg(long = "role")]
        roles: Vec<Role>,
    },
    /// Show or change the saved interface language.
    Language {
        #[arg(long, env = "LOCALE_STORE_PATH", default_value = DEFAULT_LOCALE_STORE_PATH)]
        store: String,
        #[command(subcommand)]
        command: LanguageCommand,
    },
}

#[derive(Subcommand, Debug)]
enum LanguageCommand {
    Show,
    Set { code: String },
}

fn access_json(access: Access) -> serde_json::Value {
    match access {
        Access::Pending => json!({ "outcome": "pending" }),
        Access::Render => json!({ "outcome": "render" }),
        Access::Redirect(path) => json!({ "outcome": "redirect", "to": path }),
    }
}

fn state_json(state: &SessionState) -> serde_json::Value {
    json!({
        "loading": state.loading(),
        "user": state.user(),
        "profile": state.profile(),
    })
}

async fn connect() -> Result<SessionMachine, CliError> {
    let config = AuthConfig::from_env()?;
    let mut client = SupabaseClient::new(&config.supabase_url, config.supabase_anon_key.clone(), config.request_timeout)?;
    if let Some(tokens) = config.session {
        client = client.with_session(tokens);
    }
    let client = Arc::new(client);
    let machine = SessionMachine::new(client.clone(), client, config.machine);
    machine.initialize().await?;
    Ok(machine)
}

async fn run(command: Command) -> Result<ExitCode, CliError> {
    match command {
        Command::SignIn { login, roles } => {
            let machine = connect().await?;
            machine.sign_in(&login.email, &login.password).await?;
            let state = machine.snapshot();
            let out = json!({ "state": state_json(&state), "access": access_json(machine.can_access(&roles)) });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Session { roles } => {
            let machine = connect().await?;
            let state = machine.snapshot();
            let out = json!({ "state": state_json(&state), "access": access_json(machine.can_access(&roles)) });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::SignUp { login, name } => {
            let machine = connect().await?;
            match machine.sign_up(&login.email, &login.password, &name).await {
                Ok(SignUp::SignedIn(_)) => {
                    println!("{}", serde_json::to_string_pretty(&state_json(&machine.snapshot()))?);
                }
                Ok(SignUp::ConfirmationPending(account)) => {
                    println!("account {} created, confirm {} before signing in", account.user_id, account.email);
                }
                Err(e @ AuthError::ProfileCreation { .. }) => {
                    eprintln!("account created without a profile, remediation required: {e}");
                    return Ok(ExitCode::from(2));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::ResetPassword { email } => {
            let machine = connect().await?;
            machine.reset_password(&email).await?;
            println!("reset link sent to {email} (redirect: {})", machine.config().reset_redirect);
        }
        Command::UpdatePassword { login, new_password } => {
            let machine = connect().await?;
            machine.sign_in(&login.email, &login.password).await?;
            machine.update_password(&new_password).await?;
            machine.sign_out().await?;
            println!("password updated for {}", login.email);
        }
        Command::Check { login, roles } => {
            let machine = connect().await?;
            let access = match machine.sign_in(&login.email, &login.password).await {
                Ok(_) => machine.can_access(&roles),
                Err(AuthError::Credential(message)) => {
                    tracing::info!(%message, "credentials refused");
                    machine.can_access(&roles)
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&access_json(access))?);
            if !access.is_render() {
                return Ok(ExitCode::from(3));
            }
        }
        Command::Language { store, command } => {
            let store = LocaleStore::new(store);
            match command {
                LanguageCommand::Show => println!("{}", store.load()),
                LanguageCommand::Set { code } => {
                    let locale: Locale = code.parse()?;
                    store.save(locale)?;
                    println!("{locale}");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "authgate failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
