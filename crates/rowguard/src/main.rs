use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use rowguard::config;
use rowguard::observability::init_observability;
use rowguard::{
    AccessControlList, AccessType, AuthenticationMethod, TokenProvider, UserProfile, consolidate,
};

#[derive(Parser, Debug)]
#[command(name = "rowguard")]
#[command(about = "Token and policy tooling for the rowguard authorization engine", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable JSON logging output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue, inspect and step up tokens
    #[command(subcommand)]
    Token(TokenCommand),
    /// Inspect access control lists
    #[command(subcommand)]
    Acl(AclCommand),
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Issue a base token for a user
    Issue(IssueArgs),
    /// Verify a token and print its claims
    Decode {
        /// Token, with or without the "Bearer " prefix
        token: String,
    },
    /// Add a fresh factor to an existing token
    StepUp {
        token: String,
        /// Method that was just completed (pwd, mgl, otp, wb3, passkey, api_key)
        #[arg(short, long)]
        method: String,
    },
}

#[derive(ClapArgs, Debug)]
struct IssueArgs {
    /// Subject (user id)
    #[arg(short, long)]
    user: String,

    #[arg(long)]
    username: Option<String>,

    /// Initial authentication method
    #[arg(short, long, default_value = "pwd")]
    method: String,
}

#[derive(Subcommand, Debug)]
enum AclCommand {
    /// Show the consolidated grants a set of roles receives from a JSON ACL
    Inspect {
        /// JSON file of the form {"role": {"read": true, ...}}
        file: PathBuf,

        #[arg(short, long = "role")]
        roles: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut builder = if let Some(ref path) = args.config {
        config::load_config_from_path(path)?
    } else {
        config::load_config()?
    };

    if args.verbose {
        builder = builder.log_level("debug");
    }
    if args.json_logs {
        builder = builder.json_logs(true);
    }

    let config = builder.build()?;
    init_observability(&config.telemetry)?;
    config.warn_on_defaults();

    match args.command {
        Command::Token(command) => {
            let tokens = TokenProvider::new(config.token.clone())?;
            let shutdown = CancellationToken::new();
            let refresh = tokens.spawn_jwks_refresh(shutdown.clone());

            let result = run_token(&tokens, command).await;

            shutdown.cancel();
            if let Some(handle) = refresh {
                handle.await?;
            }
            result
        }
        Command::Acl(AclCommand::Inspect { file, roles }) => {
            inspect_acl(&file, &roles, config.admin_role())
        }
    }
}

async fn run_token(tokens: &TokenProvider, command: TokenCommand) -> anyhow::Result<()> {
    match command {
        TokenCommand::Issue(issue) => {
            let method: AuthenticationMethod = issue.method.parse()?;
            let mut user = UserProfile::new(issue.user, Vec::new());
            user.username = issue.username;
            println!("{}", tokens.generate_token(&user, method)?);
        }
        TokenCommand::Decode { token } => {
            let claims = tokens.decode_token(&token).await?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        TokenCommand::StepUp { token, method } => {
            let method: AuthenticationMethod = method.parse()?;
            let claims = tokens.decode_token(&token).await?;
            println!("{}", tokens.step_up_token(&claims, method)?);
        }
    }
    Ok(())
}

fn inspect_acl(file: &Path, roles: &[String], admin_role: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let acl = AccessControlList::from_json(&value)?;

    let entry = consolidate(Some(&acl), roles, admin_role);
    for access in AccessType::ALL {
        let grant = match entry.get(access) {
            None => "denied",
            Some(value) if value.is_unconditional() => "granted",
            Some(_) => "filtered",
        };
        println!("{:<8} {grant}", access.as_str());
    }
    if !entry.restricted_fields().is_empty() {
        let fields: Vec<&str> = entry.restricted_fields().iter().map(String::as_str).collect();
        println!("restricted fields: {}", fields.join(", "));
    }
    Ok(())
}
