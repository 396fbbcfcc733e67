use clap::{Arg, Command};
use log::LevelFilter;
use mailshield::decision::Verdict;
use mailshield::pipeline::Pipeline;
use mailshield::store::{MemoryFeatureStore, MemoryFeedbackStore, MemorySenderGraph};
use mailshield::{CompactEmail, Config};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailshield")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email phishing risk scoring and disposition pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mailshield.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("analyze")
                .long("analyze")
                .value_name("FILE")
                .help("Analyze a compact-email JSON file and print the decision document")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("phi-entities")
                .long("phi-entities")
                .value_name("N")
                .help("Sensitive-entity count reported by the upstream redaction step")
                .default_value("0"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        match generate_config(path) {
            Ok(()) => {
                println!("Generated default configuration at {path}");
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate configuration: {e}");
                process::exit(1);
            }
        }
    }

    let config_path = matches.get_one::<String>("config").unwrap();

    if matches.get_flag("test-config") {
        match Config::load(config_path) {
            Ok(config) => {
                println!(
                    "Configuration OK: {} org(s), {} brand domain(s)",
                    config.organizations.len(),
                    config.brand_domains.len()
                );
                return;
            }
            Err(e) => {
                eprintln!("Configuration error: {e}");
                process::exit(1);
            }
        }
    }

    let config = load_config(config_path);

    if let Some(email_path) = matches.get_one::<String>("analyze") {
        let phi_entities: u32 = matches
            .get_one::<String>("phi-entities")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if let Err(e) = analyze_file(config, email_path, phi_entities).await {
            eprintln!("Analysis failed: {e}");
            process::exit(1);
        }
        return;
    }

    eprintln!("Nothing to do. Try --analyze <FILE> or --generate-config <FILE>.");
    process::exit(2);
}

fn generate_config(path: &str) -> anyhow::Result<()> {
    let config = Config::default();
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Load the config, falling back to defaults when the file is absent so the
/// offline analyze path works out of the box.
fn load_config(path: &str) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Could not load {path} ({e}); using built-in defaults");
            let mut config = Config::default();
            config
                .compile_patterns()
                .expect("default config patterns must compile");
            config
        }
    }
}

async fn analyze_file(config: Config, email_path: &str, phi_entities: u32) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(email_path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let email = CompactEmail::from_value(&value);

    let pipeline = Pipeline::new(
        Arc::new(config),
        Arc::new(MemoryFeatureStore::new()),
        Arc::new(MemoryFeatureStore::new()),
        Arc::new(MemorySenderGraph::new()),
        Arc::new(MemoryFeedbackStore::new()),
    )?;

    let assessment = pipeline.analyze(&email, phi_entities, Verdict::Allow).await;
    println!("{}", serde_json::to_string_pretty(&assessment.to_value())?);
    Ok(())
}
