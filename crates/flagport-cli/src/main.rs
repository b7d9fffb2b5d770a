use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use flagport_api::{ApiClient, ApiGateway, RateGovernor, ReqwestTransport, SystemClock};
use flagport_core::{FsSourceStore, MigrationConfig, MigrationOrchestrator, MigrationReport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TOKEN_ENV: &str = "FLAGPORT_DESTINATION_TOKEN";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn cli() -> Command {
    Command::new("flagport")
        .version(flagport_core::VERSION)
        .about("Migrate a feature-flag project into another account")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_parser(value_parser!(PathBuf))
                .help("YAML configuration file"),
        )
        .arg(
            Arg::new("source-project")
                .long("source-project")
                .help("Source project key"),
        )
        .arg(
            Arg::new("destination-project")
                .long("destination-project")
                .help("Destination project key"),
        )
        .arg(
            Arg::new("source-root")
                .long("source-root")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding extracted source data"),
        )
        .arg(
            Arg::new("source-domain")
                .long("source-domain")
                .help("Source API host"),
        )
        .arg(
            Arg::new("destination-domain")
                .long("destination-domain")
                .help("Destination API host"),
        )
        .arg(
            Arg::new("conflict-prefix")
                .long("conflict-prefix")
                .help("Prefix for keys that collide in the destination"),
        )
        .arg(
            Arg::new("target-view")
                .long("target-view")
                .help("View to link every migrated flag to"),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .action(ArgAction::Append)
                .help("Source environment to migrate (repeatable; default all)"),
        )
        .arg(
            Arg::new("rename-env")
                .long("rename-env")
                .action(ArgAction::Append)
                .value_name("SOURCE=DEST")
                .help("Destination key for a source environment"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .value_parser(value_parser!(usize))
                .help("Flags migrated in parallel"),
        )
        .arg(
            Arg::new("skip-segments")
                .long("skip-segments")
                .action(ArgAction::SetTrue)
                .help("Do not migrate segments"),
        )
        .arg(
            Arg::new("block-on-declined")
                .long("block-on-declined")
                .action(ArgAction::SetTrue)
                .help("Treat declined approval requests as still open"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Look up everything, write nothing"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .env(TOKEN_ENV)
                .hide_env_values(true)
                .help("Destination API access token"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Config file (if any) with command-line overrides applied
fn load_config(args: &ArgMatches) -> anyhow::Result<MigrationConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => MigrationConfig::load(path)?,
        None => MigrationConfig::default(),
    };

    if let Some(project) = args.get_one::<String>("source-project") {
        config.source_project.clone_from(project);
    }
    if let Some(project) = args.get_one::<String>("destination-project") {
        config.destination_project.clone_from(project);
    }
    if let Some(root) = args.get_one::<PathBuf>("source-root") {
        config = config.with_source_root(root);
    }
    if let Some(domain) = args.get_one::<String>("source-domain") {
        config = config.with_source_domain(domain);
    }
    if let Some(domain) = args.get_one::<String>("destination-domain") {
        config = config.with_destination_domain(domain);
    }
    if let Some(prefix) = args.get_one::<String>("conflict-prefix") {
        config = config.with_conflict_prefix(prefix);
    }
    if let Some(view) = args.get_one::<String>("target-view") {
        config = config.with_target_view(view);
    }
    if let Some(envs) = args.get_many::<String>("env") {
        config = config.with_environments(envs.cloned());
    }
    for rename in args.get_many::<String>("rename-env").into_iter().flatten() {
        let Some((from, to)) = rename.split_once('=') else {
            bail!("--rename-env expects SOURCE=DEST, got '{rename}'");
        };
        config = config.with_environment_rename(from, to);
    }
    if let Some(concurrency) = args.get_one::<usize>("concurrency") {
        config = config.with_concurrency(*concurrency);
    }
    if args.get_flag("skip-segments") {
        config = config.with_segments(false);
    }
    if args.get_flag("block-on-declined") {
        config = config.with_block_on_declined(true);
    }
    if args.get_flag("dry-run") {
        config = config.with_dry_run(true);
    }

    config.validate()?;
    Ok(config)
}

async fn migrate(args: &ArgMatches) -> anyhow::Result<MigrationReport> {
    let config = load_config(args)?;
    let Some(token) = args.get_one::<String>("token") else {
        bail!("no destination token; set {TOKEN_ENV} or pass --token");
    };

    let gateway = ApiGateway::new(&config.destination_domain, token)?;
    let governor = Arc::new(RateGovernor::new(Arc::new(SystemClock)));
    let transport = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
    let client = ApiClient::new(gateway, governor, transport);
    let source = FsSourceStore::new(&config.source_root, &config.source_project);

    let orchestrator = MigrationOrchestrator::new(config, client, source)?;
    let report = tokio::select! {
        report = orchestrator.run() => report.context("migration aborted")?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli().get_matches();
    init_tracing(args.get_flag("json-logs"));

    let report = match migrate(&args).await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "migration failed");
            eprintln!("error: {err:#}");
            return ExitCode::from(1);
        }
    };

    if args.get_flag("json") {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("error: cannot serialize report: {err}");
                return ExitCode::from(1);
            }
        }
    } else {
        print!("{report}");
    }

    if report.is_complete_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> ArgMatches {
        let mut full = vec!["flagport"];
        full.extend_from_slice(argv);
        cli().try_get_matches_from(full).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&[
            "--source-project",
            "legacy",
            "--destination-project",
            "platform",
            "--env",
            "production",
            "--env",
            "test",
            "--rename-env",
            "production=prod",
            "--conflict-prefix",
            "imported-",
            "--concurrency",
            "4",
            "--source-domain",
            "app.eu.launchdarkly.com",
            "--dry-run",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.source_project, "legacy");
        assert_eq!(config.source_domain, "app.eu.launchdarkly.com");
        assert_eq!(config.destination_domain, flagport_core::DEFAULT_DOMAIN);
        assert_eq!(config.environment_allowlist, vec!["production", "test"]);
        assert_eq!(config.dest_environment_key("production"), "prod");
        assert_eq!(config.conflict_prefix.as_deref(), Some("imported-"));
        assert_eq!(config.concurrency, 4);
        assert!(config.dry_run);
        assert!(config.migrate_segments);
    }

    #[test]
    fn malformed_rename_is_rejected() {
        let args = parse(&[
            "--source-project",
            "a",
            "--destination-project",
            "b",
            "--rename-env",
            "prod",
        ]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn blank_source_domain_is_rejected() {
        let args = parse(&[
            "--source-project",
            "a",
            "--destination-project",
            "b",
            "--source-domain",
            " ",
        ]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn missing_projects_fail_validation() {
        assert!(load_config(&parse(&[])).is_err());
    }
}
