use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Parser, ValueEnum};
use serde::Deserialize;
use weightdur_core::{EchoStrategy, ReconcileConfig, WeightDurations};
use weightdur_mimic::tables::{load_extract_dir, write_weight_durations_csv};
use weightdur_mimic::derive_weight_durations;

mod logging;

#[derive(Parser, Debug)]
#[command(
    name = "weightdur",
    about = "Recompute per-ICU-stay weight durations from MIMIC-III data."
)]
#[command(group(ArgGroup::new("source").required(true).args(["input", "mimic_dir"])))]
struct Args {
    /// JSON extract with icustays, chartevents and echodata arrays.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory holding ICUSTAYS.csv, CHARTEVENTS.csv and optionally ECHODATA.csv.
    #[arg(long)]
    mimic_dir: Option<PathBuf>,

    /// Output file, replaced atomically. Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Format::Json)]
    format: Format,

    /// TOML file with a [reconcile] table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the boundary fuzziness margin in hours.
    #[arg(long)]
    fuzziness_hours: Option<u32>,

    /// Overrides how echo weights cover stays without charted weights.
    #[arg(long, value_enum)]
    echo_strategy: Option<EchoArg>,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EchoArg {
    Sequential,
    Median,
}

impl From<EchoArg> for EchoStrategy {
    fn from(arg: EchoArg) -> Self {
        match arg {
            EchoArg::Sequential => EchoStrategy::Sequential,
            EchoArg::Median => EchoStrategy::Median,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    reconcile: ReconcileConfig,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    let config = resolve_config(&args)?;
    tracing::info!(?config, "reconciling weight durations");

    let extract = match (&args.input, &args.mimic_dir) {
        (Some(path), _) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("failed to read extract {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse extract {}", path.display()))?
        }
        (None, Some(dir)) => load_extract_dir(dir)
            .with_context(|| format!("failed to load MIMIC tables from {}", dir.display()))?,
        (None, None) => anyhow::bail!("either --input or --mimic-dir is required"),
    };

    let durations = derive_weight_durations(&extract, &config)?;
    tracing::info!(
        stays = durations.stay_ids().len(),
        intervals = durations.len(),
        "weight durations ready"
    );

    let rendered = render(&durations, args.format)?;
    match &args.output {
        Some(path) => replace_file(path, &rendered)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => io::stdout().lock().write_all(&rendered)?,
    }

    Ok(())
}

fn resolve_config(args: &Args) -> anyhow::Result<ReconcileConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
                .reconcile
        }
        None => ReconcileConfig::default(),
    };

    if let Some(hours) = args.fuzziness_hours {
        config.fuzziness_hours = hours;
    }
    if let Some(strategy) = args.echo_strategy {
        config.echo_strategy = strategy.into();
    }
    config.validate()?;
    Ok(config)
}

fn render(durations: &WeightDurations, format: Format) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut buffer, durations)?;
            buffer.push(b'\n');
        }
        Format::Csv => write_weight_durations_csv(durations, &mut buffer)?,
    }
    Ok(buffer)
}

/// Writes next to the target and renames over it, so readers never see a partial table.
fn replace_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;
    staged.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["weightdur", "--input", "extract.json"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("weightdur.toml");
        fs::write(&path, "[reconcile]\nfuzziness_hours = 4\necho_strategy = \"median\"\n")
            .expect("write config");

        let from_file = resolve_config(&args(&["--config", path.to_str().expect("utf8 path")]))
            .expect("config from file");
        assert_eq!(from_file.fuzziness_hours, 4);
        assert_eq!(from_file.echo_strategy, EchoStrategy::Median);

        let overridden = resolve_config(&args(&[
            "--config",
            path.to_str().expect("utf8 path"),
            "--fuzziness-hours",
            "3",
            "--echo-strategy",
            "sequential",
        ]))
        .expect("overridden config");
        assert_eq!(overridden.fuzziness_hours, 3);
        assert_eq!(overridden.echo_strategy, EchoStrategy::Sequential);
    }

    #[test]
    fn zero_margin_is_rejected() {
        assert!(resolve_config(&args(&["--fuzziness-hours", "0"])).is_err());
    }

    #[test]
    fn oversized_margin_is_rejected() {
        assert!(resolve_config(&args(&["--fuzziness-hours", "4294967295"])).is_err());
        assert!(resolve_config(&args(&["--fuzziness-hours", "168"])).is_ok());
    }

    #[test]
    fn a_source_is_required() {
        assert!(Args::try_parse_from(["weightdur"]).is_err());
    }

    #[test]
    fn output_is_replaced_whole() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("weightdurations.csv");
        fs::write(&path, "stale contents that are longer than the new table").expect("seed file");

        replace_file(&path, b"icustay_id,starttime,endtime,weight\n").expect("replace");

        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "icustay_id,starttime,endtime,weight\n"
        );
    }
}
