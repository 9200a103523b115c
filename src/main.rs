//! dsctl - Thread Operational Dataset tool
//!
//! Decode dataset TLV blobs, generate a fresh network, inspect a node's
//! persisted datasets and validate engine configuration files.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use meshcop_dataset::{
    storage::SettingsKey, Channel, Dataset, DatasetConfig, DatasetKind, FileSettings, MeshcopTlv,
    SettingsStore,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dsctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DSCTL_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a hex-encoded dataset TLV blob
    Decode {
        /// Dataset TLVs as hex
        hex: String,

        /// Interpret as a Pending dataset
        #[arg(long)]
        pending: bool,
    },

    /// Generate a new Active dataset with random credentials
    Generate {
        /// IEEE 802.15.4 channel (11-26)
        #[arg(long, default_value_t = 11)]
        channel: u16,

        #[arg(long, default_value = "OpenThread")]
        network_name: String,

        /// Print the decoded fields instead of the hex blob
        #[arg(long)]
        json: bool,
    },

    /// Show datasets persisted in a node's state directory
    Show {
        #[arg(long)]
        state_dir: PathBuf,
    },

    /// Validate an engine configuration file (YAML or JSON)
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    debug!(?cli, "dsctl starting");

    let output = match cli.command {
        Commands::Decode { hex, pending } => decode(&hex, pending)?,
        Commands::Generate {
            channel,
            network_name,
            json,
        } => generate(channel, &network_name, json)?,
        Commands::Show { state_dir } => show(state_dir)?,
        Commands::CheckConfig { path } => check_config(path)?,
    };
    println!("{output}");
    Ok(())
}

fn decode(hex_blob: &str, pending: bool) -> Result<String> {
    let bytes = hex::decode(hex_blob.trim()).context("dataset is not valid hex")?;
    let kind = if pending {
        DatasetKind::Pending
    } else {
        DatasetKind::Active
    };
    let dataset = Dataset::decode(kind, &bytes).context("failed to decode dataset")?;
    let mut described = describe(&dataset);
    let missing = dataset.missing_fields();
    if !missing.is_empty() {
        described["missing"] = json!(missing);
    }
    Ok(serde_json::to_string_pretty(&described)?)
}

fn generate(channel: u16, network_name: &str, as_json: bool) -> Result<String> {
    let config = DatasetConfig::default();
    if !config.supported_channels().contains(channel) {
        return Err(anyhow!("channel {channel} is not a supported 2.4 GHz channel"));
    }
    let mut rng = rand::rng();
    let dataset = Dataset::generate_network(&mut rng, Channel::new(channel), network_name)
        .context("failed to generate dataset")?;
    info!(channel, network_name, len = dataset.encoded_len(), "generated dataset");
    if as_json {
        Ok(serde_json::to_string_pretty(&describe(&dataset))?)
    } else {
        Ok(hex::encode(dataset.encode()))
    }
}

fn show(state_dir: PathBuf) -> Result<String> {
    let store = FileSettings::open(&state_dir)
        .with_context(|| format!("cannot open state directory {}", state_dir.display()))?;
    let mut out = Map::new();
    for kind in [DatasetKind::Active, DatasetKind::Pending] {
        let key = SettingsKey::from(kind);
        let entry = match store.read(key)? {
            None => Value::Null,
            Some(record) => {
                let mut entry = match Dataset::decode(kind, &record.tlvs) {
                    Ok(dataset) => describe(&dataset),
                    Err(e) => json!({ "error": e.to_string(), "raw": hex::encode(&record.tlvs) }),
                };
                entry["saved_at"] = json!(record.saved_at.to_rfc3339());
                if let Some(ms) = record.delay_remaining_ms {
                    entry["delay_remaining_ms"] = json!(ms);
                }
                entry
            }
        };
        out.insert(kind.as_str().to_string(), entry);
    }
    Ok(serde_json::to_string_pretty(&Value::Object(out))?)
}

fn check_config(path: PathBuf) -> Result<String> {
    let config = DatasetConfig::from_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .map_err(|reason| anyhow!("invalid configuration: {reason}"))?;
    Ok(serde_json::to_string_pretty(&config)?)
}

/// JSON view of a dataset, one key per TLV.
fn describe(dataset: &Dataset) -> Value {
    let mut map = Map::new();
    map.insert("kind".into(), json!(dataset.kind().as_str()));
    for tlv in dataset.tlvs().iter() {
        let (name, value) = match tlv.meshcop_type() {
            Some(known) => (
                known.name().replace([' ', '-'], "_"),
                describe_field(dataset, known, tlv.value()),
            ),
            None => (
                format!("unknown_{}", tlv.tlv_type()),
                json!(hex::encode(tlv.value())),
            ),
        };
        map.insert(name, value);
    }
    Value::Object(map)
}

fn describe_field(dataset: &Dataset, tlv: MeshcopTlv, raw: &[u8]) -> Value {
    match tlv {
        MeshcopTlv::ActiveTimestamp => json!(dataset.active_timestamp().map(|t| t.to_string())),
        MeshcopTlv::PendingTimestamp => json!(dataset.pending_timestamp().map(|t| t.to_string())),
        MeshcopTlv::DelayTimer => json!(dataset.delay_timer().map(|d| d.as_millis() as u64)),
        MeshcopTlv::Channel => json!(dataset.channel().map(|c| c.number)),
        MeshcopTlv::ChannelMask => {
            json!(dataset.channel_mask().map(|m| m.channels().collect::<Vec<_>>()))
        }
        MeshcopTlv::PanId => json!(dataset.pan_id().map(|p| format!("{p:#06x}"))),
        MeshcopTlv::ExtendedPanId => json!(dataset.extended_pan_id().map(|x| x.to_string())),
        MeshcopTlv::MeshLocalPrefix => json!(dataset.mesh_local_prefix().map(|p| p.to_string())),
        MeshcopTlv::NetworkName => json!(dataset.network_name()),
        MeshcopTlv::SecurityPolicy => match dataset.security_policy() {
            Some(policy) => {
                let caps = policy.discovery_capabilities();
                json!({
                    "rotation_time_hours": policy.rotation_time_hours,
                    "flags": hex::encode(raw.get(2..).unwrap_or_default()),
                    "network_key_obtainable": caps.network_key_obtainable,
                    "native_commissioning": caps.native_commissioning,
                    "routers_allowed": caps.routers_allowed,
                })
            }
            None => json!(hex::encode(raw)),
        },
        _ => json!(hex::encode(raw)),
    }
}
