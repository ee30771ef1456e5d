use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use skyward::action_ledger::ActionLedger;
use skyward::assistant::Assistant;
use skyward::config::Config;
use skyward::confirmation_ui::{ConfirmationUI, Decision, Proposal};
use skyward::credential_broker::StsTrustProvider;
use skyward::identity::ExternalId;
use skyward::janitor::WorkspaceJanitor;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn role_args() -> [Arg; 2] {
    [
        Arg::new("role-arn")
            .long("role-arn")
            .help("ARN of the role delegated to this service")
            .value_name("ARN")
            .num_args(1),
        Arg::new("external-id")
            .long("external-id")
            .help("External id from the role's trust policy")
            .value_name("ID")
            .num_args(1),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skyward=info")))
        .with_writer(io::stderr)
        .init();

    let matches = Command::new("skyward")
        .about("Plan and apply infrastructure changes in a delegated AWS account")
        .arg(Arg::new("config")
            .long("config")
            .help("Show configuration information")
            .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("set-region")
            .long("set-region")
            .help("Save the default AWS region")
            .value_name("REGION")
            .num_args(1))
        .subcommand(Command::new("external-id")
            .about("Generate a new external id for a role trust policy"))
        .subcommand(Command::new("verify")
            .about("Verify a role delegation and print the result as JSON")
            .args(role_args().map(|a| a.required(true))))
        .subcommand(Command::new("session")
            .about("Start an interactive session")
            .args(role_args())
            .arg(Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Show rendered configuration in confirmation dialogs")
                .action(clap::ArgAction::SetTrue)))
        .subcommand(Command::new("sweep")
            .about("Remove workspaces older than the configured age"))
        .get_matches();

    if let Some(region) = matches.get_one::<String>("set-region") {
        let mut config = Config::load()?;
        config.region = region.clone();
        config.save()?;
        println!("✅ Region saved: {}", region);
        return Ok(());
    }

    if matches.get_flag("config") {
        Config::show_config_info()?;
        return Ok(());
    }

    let config = Config::load()?;

    match matches.subcommand() {
        Some(("external-id", _)) => {
            println!("{}", ExternalId::generate().as_str());
            Ok(())
        }
        Some(("verify", args)) => verify(&config, args).await,
        Some(("session", args)) => session(&config, args).await,
        Some(("sweep", _)) => sweep(&config),
        _ => {
            eprintln!("No command provided. Use 'skyward --help' for usage information.");
            Ok(())
        }
    }
}

async fn build_assistant(config: &Config) -> (Assistant, Arc<ActionLedger>) {
    let provider = Arc::new(StsTrustProvider::new(&config.region).await);
    let ledger = Arc::new(ActionLedger::new(config.action_ttl()));
    (Assistant::from_config(config, provider, Arc::clone(&ledger)), ledger)
}

async fn verify(config: &Config, args: &ArgMatches) -> Result<()> {
    let role_arn = args.get_one::<String>("role-arn").context("--role-arn is required")?;
    let external_id = args.get_one::<String>("external-id").context("--external-id is required")?;

    let (assistant, _) = build_assistant(config).await;
    let response = assistant
        .verify_role(role_arn, external_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message(config.environment)))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn session(config: &Config, args: &ArgMatches) -> Result<()> {
    let role_arn = args.get_one::<String>("role-arn").map(String::as_str);
    let external_id = args.get_one::<String>("external-id").map(String::as_str);
    let ui = ConfirmationUI::new(args.get_flag("verbose"));

    let (assistant, ledger) = build_assistant(config).await;
    let janitor = Arc::new(WorkspaceJanitor::new(config.workspace_root()));
    let janitor_task = janitor.spawn(ledger, config.janitor_interval(), config.workspace_max_age());

    if let (Some(role_arn), Some(external_id)) = (role_arn, external_id) {
        match assistant.verify_role(role_arn, external_id).await {
            Ok(response) if response.valid => {
                println!("🔗 Connected to account {}", response.account_id.unwrap_or_default());
            }
            Ok(response) => println!("⚠️  {}", response.error.unwrap_or_default()),
            Err(e) => println!("⚠️  {}", e.public_message(assistant.environment())),
        }
    } else {
        println!("ℹ️  No role connected. Questions work; changes need --role-arn and --external-id.");
    }
    println!("Type a request, or 'exit' to quit.");

    loop {
        print!("\nskyward> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "exit" | "quit") {
            break;
        }

        info!("Session request: {}", message);
        let response = match assistant.chat(message, role_arn, external_id).await {
            Ok(response) => response,
            Err(e) => {
                println!("❌ {}", e.public_message(assistant.environment()));
                continue;
            }
        };

        let Some(proposal) = Proposal::from_chat(&response) else {
            println!("{}", response.message());
            continue;
        };
        println!("{}", response.message());

        match ui.prompt(&proposal)? {
            Decision::Apply => {
                let (Some(role_arn), Some(external_id)) = (role_arn, external_id) else {
                    continue;
                };
                println!("⏳ Applying...");
                match assistant.apply(proposal.action_id, role_arn, external_id).await {
                    Ok(result) => ui.show_apply_result(&result),
                    Err(e) => println!("❌ {}", e.public_message(assistant.environment())),
                }
            }
            Decision::Discard => {
                assistant.discard(proposal.action_id);
                ui.show_discarded();
            }
        }
    }

    janitor_task.abort();
    Ok(())
}

fn sweep(config: &Config) -> Result<()> {
    let janitor = WorkspaceJanitor::new(config.workspace_root());
    match janitor.sweep(config.workspace_max_age()) {
        Some(report) => {
            println!(
                "🧹 Removed {} workspace(s) from {}",
                report.removed.len(),
                janitor.root().display()
            );
            if report.failed > 0 {
                println!("⚠️  {} workspace(s) could not be removed", report.failed);
            }
        }
        None => println!("A sweep is already running"),
    }
    Ok(())
}
