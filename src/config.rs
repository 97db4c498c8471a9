use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub skins_dir: String,
    pub compiled_dir: String,
    pub database_url: String,
    pub org_name: String,
    pub vehicle_dir_template: String,
    pub livery_dir_template: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Skin bundle distribution service")]
pub struct Args {
    /// Host to bind to (overrides SKIN_DEPOT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SKIN_DEPOT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root of the per-skin asset folders (overrides SKIN_DEPOT_SKINS_DIR)
    #[arg(long)]
    pub skins_dir: Option<String>,

    /// Directory for published archives (overrides SKIN_DEPOT_COMPILED_DIR)
    #[arg(long)]
    pub compiled_dir: Option<String>,

    /// Database URL (overrides SKIN_DEPOT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Prefix of bulk bundle names (overrides SKIN_DEPOT_ORG_NAME)
    #[arg(long)]
    pub org_name: Option<String>,

    /// Vehicle definition folder, relative to skins dir, with `{id}` (overrides SKIN_DEPOT_VEHICLE_DIR_TEMPLATE)
    #[arg(long)]
    pub vehicle_dir_template: Option<String>,

    /// Livery folder, relative to skins dir, with `{id}` (overrides SKIN_DEPOT_LIVERY_DIR_TEMPLATE)
    #[arg(long)]
    pub livery_dir_template: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse(), |key| env::var(key))
    }

    /// Merge CLI args over values from `lookup`, falling back to defaults.
    fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|_| default.into());

        let env_port = match lookup("SKIN_DEPOT_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing SKIN_DEPOT_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading SKIN_DEPOT_PORT"),
        };

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| var("SKIN_DEPOT_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            skins_dir: args
                .skins_dir
                .unwrap_or_else(|| var("SKIN_DEPOT_SKINS_DIR", "./skins")),
            compiled_dir: args
                .compiled_dir
                .unwrap_or_else(|| var("SKIN_DEPOT_COMPILED_DIR", "./compiled")),
            database_url: args
                .database_url
                .unwrap_or_else(|| var("SKIN_DEPOT_DATABASE_URL", "sqlite://./data/skins.db")),
            org_name: args
                .org_name
                .unwrap_or_else(|| var("SKIN_DEPOT_ORG_NAME", "skins")),
            vehicle_dir_template: args
                .vehicle_dir_template
                .unwrap_or_else(|| var("SKIN_DEPOT_VEHICLE_DIR_TEMPLATE", "{id}/Cars")),
            livery_dir_template: args
                .livery_dir_template
                .unwrap_or_else(|| var("SKIN_DEPOT_LIVERY_DIR_TEMPLATE", "{id}/Liveries")),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
