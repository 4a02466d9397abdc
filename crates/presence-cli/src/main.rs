use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use zbus::proxy;

#[proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    fn register_person(&self, request: &str) -> zbus::Result<String>;
    fn record_entry(&self, request: &str) -> zbus::Result<String>;
    fn record_exit(&self, request: &str) -> zbus::Result<String>;
    fn mark_exit(&self, request: &str) -> zbus::Result<String>;
    fn get_record(&self, request: &str) -> zbus::Result<String>;
    fn report_unknown(&self, request: &str) -> zbus::Result<String>;
    fn list_unknown(&self, request: &str) -> zbus::Result<String>;
    fn review_unknown(&self, request: &str) -> zbus::Result<String>;
    fn delete_unknown(&self, request: &str) -> zbus::Result<String>;
    fn unknown_image(&self, request: &str) -> zbus::Result<String>;
    fn active_persons(&self, request: &str) -> zbus::Result<String>;
    fn zone_log(&self, request: &str) -> zbus::Result<String>;
    fn query_records(&self, request: &str) -> zbus::Result<String>;
    fn analytics(&self, request: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence tracking CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or rename a person in the registry
    Register {
        /// STUDENT or TEACHER
        #[arg(short, long)]
        kind: String,
        #[arg(short, long)]
        id: i64,
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// Record a person entering a zone
    Entry {
        #[arg(short, long)]
        kind: String,
        #[arg(short, long)]
        id: i64,
        #[arg(short, long)]
        zone: i64,
        #[arg(long)]
        camera: Option<i64>,
        /// RFC 3339 timestamp (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Record a person leaving (a zone, or wherever they are)
    Exit {
        #[arg(short, long)]
        kind: String,
        #[arg(short, long)]
        id: i64,
        #[arg(short, long)]
        zone: Option<i64>,
        #[arg(long)]
        at: Option<String>,
    },
    /// Close a specific record now
    MarkExit {
        /// Presence record ID
        record: i64,
    },
    /// Show one presence record
    Record {
        /// Presence record ID
        record: i64,
    },
    /// List who is currently inside
    Active {
        #[arg(short, long)]
        zone: Option<i64>,
        /// Only this person (requires --id)
        #[arg(short, long, requires = "id")]
        kind: Option<String>,
        #[arg(short, long, requires = "kind")]
        id: Option<i64>,
    },
    /// Show a zone's activity log
    Logs {
        #[arg(short, long)]
        zone: i64,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Search presence records
    Query {
        #[arg(short, long)]
        zone: Option<i64>,
        #[arg(short, long)]
        kind: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Today's entry counts and current occupancy
    Analytics,
    /// Review unknown-face captures
    #[command(subcommand)]
    Unknown(UnknownCommands),
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum UnknownCommands {
    /// List captures, newest first
    List {
        /// PENDING, IDENTIFIED or IGNORED
        #[arg(short, long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Set the review status of a capture
    Review {
        id: i64,
        #[arg(short, long)]
        status: String,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Delete a capture
    Delete { id: i64 },
    /// Submit a JPEG face crop taken outside the daemon
    Report {
        file: PathBuf,
        #[arg(short, long)]
        zone: Option<i64>,
        #[arg(short, long)]
        confidence: Option<f32>,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Save the captured image of one detection
    Image {
        id: i64,
        #[arg(short, long)]
        out: PathBuf,
    },
}

/// Unwrap the daemon's `{status, data | error}` envelope.
fn envelope(reply: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    if !value.is_object() {
        bail!("daemon returned an unexpected reply: {reply}");
    }
    let status = value["status"].as_u64().unwrap_or(500);
    if status >= 400 {
        let error = &value["error"];
        let message = error["message"].as_str().unwrap_or("request failed");
        if let Some(existing) = error.get("existing") {
            bail!("{message} ({status})\n{}", serde_json::to_string_pretty(existing)?);
        }
        bail!("{message} ({status})");
    }
    Ok(value.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_unknown(items: &Value) {
    let Some(items) = items.as_array() else {
        return;
    };
    if items.is_empty() {
        println!("No unknown detections");
        return;
    }
    for item in items {
        println!(
            "{:>6}  zone {:<4} {:<10} {}  conf {:.2}  {}",
            item["id"],
            item["zoneId"],
            item["status"].as_str().unwrap_or("?"),
            item["detectedTime"].as_str().unwrap_or("?"),
            item["confidence"].as_f64().unwrap_or(0.0),
            item["notes"].as_str().unwrap_or(""),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = PresenceProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::Register { kind, id, name } => {
            let req = json!({ "personKind": kind.to_uppercase(), "personId": id, "name": name });
            print(&envelope(&proxy.register_person(&req.to_string()).await?)?)?;
        }
        Commands::Entry {
            kind,
            id,
            zone,
            camera,
            at,
        } => {
            let req = json!({
                "personKind": kind.to_uppercase(),
                "personId": id,
                "zoneId": zone,
                "cameraId": camera,
                "timestamp": at,
            });
            print(&envelope(&proxy.record_entry(&req.to_string()).await?)?)?;
        }
        Commands::Exit { kind, id, zone, at } => {
            let req = json!({
                "personKind": kind.to_uppercase(),
                "personId": id,
                "zoneId": zone,
                "timestamp": at,
            });
            print(&envelope(&proxy.record_exit(&req.to_string()).await?)?)?;
        }
        Commands::MarkExit { record } => {
            let req = json!({ "recordId": record });
            print(&envelope(&proxy.mark_exit(&req.to_string()).await?)?)?;
        }
        Commands::Record { record } => {
            let req = json!({ "recordId": record });
            print(&envelope(&proxy.get_record(&req.to_string()).await?)?)?;
        }
        Commands::Active { zone, kind, id } => {
            let req = json!({
                "zoneId": zone,
                "personKind": kind.map(|k| k.to_uppercase()),
                "personId": id,
            });
            print(&envelope(&proxy.active_persons(&req.to_string()).await?)?)?;
        }
        Commands::Logs {
            zone,
            limit,
            offset,
        } => {
            let req = json!({ "zoneId": zone, "limit": limit, "offset": offset });
            print(&envelope(&proxy.zone_log(&req.to_string()).await?)?)?;
        }
        Commands::Query {
            zone,
            kind,
            from,
            to,
            limit,
            offset,
        } => {
            let req = json!({
                "zoneId": zone,
                "personKind": kind.map(|k| k.to_uppercase()),
                "from": from,
                "to": to,
                "limit": limit,
                "offset": offset,
            });
            print(&envelope(&proxy.query_records(&req.to_string()).await?)?)?;
        }
        Commands::Analytics => {
            print(&envelope(&proxy.analytics("{}").await?)?)?;
        }
        Commands::Unknown(UnknownCommands::List { status, limit }) => {
            let req = json!({ "status": status.map(|s| s.to_uppercase()), "limit": limit });
            print_unknown(&envelope(&proxy.list_unknown(&req.to_string()).await?)?);
        }
        Commands::Unknown(UnknownCommands::Review { id, status, notes }) => {
            let req = json!({ "id": id, "status": status.to_uppercase(), "notes": notes });
            print(&envelope(&proxy.review_unknown(&req.to_string()).await?)?)?;
        }
        Commands::Unknown(UnknownCommands::Delete { id }) => {
            envelope(&proxy.delete_unknown(&json!({ "id": id }).to_string()).await?)?;
            println!("Deleted unknown detection {id}");
        }
        Commands::Unknown(UnknownCommands::Report {
            file,
            zone,
            confidence,
            notes,
        }) => {
            let image = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let req = json!({
                "frameCrop": STANDARD.encode(image),
                "zoneId": zone,
                "confidence": confidence,
                "notes": notes,
            });
            let data = envelope(&proxy.report_unknown(&req.to_string()).await?)?;
            if data["admitted"] == false {
                println!("Suppressed: another unknown face was stored moments ago");
            } else {
                print(&data)?;
            }
        }
        Commands::Unknown(UnknownCommands::Image { id, out }) => {
            let data = envelope(&proxy.unknown_image(&json!({ "id": id }).to_string()).await?)?;
            let image = STANDARD
                .decode(data["image"].as_str().unwrap_or_default())
                .context("daemon returned an invalid image")?;
            std::fs::write(&out, image)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Saved {}", out.display());
        }
        Commands::Status => match proxy.status().await {
            Ok(status) => print(&serde_json::from_str(&status)?)?,
            Err(err) => println!("presenced: not connected ({err})"),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let data = envelope(r#"{"status":201,"data":{"id":4}}"#).unwrap();
        assert_eq!(data["id"], 4);
    }

    #[test]
    fn test_envelope_conflict_includes_existing() {
        let err = envelope(
            r#"{"status":409,"error":{"kind":"conflict","message":"STUDENT-1 already has an active entry (record 3)","existing":{"id":3}}}"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("already has an active entry"));
        assert!(err.contains("(409)"));
        assert!(err.contains("\"id\": 3"));
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(envelope("not json").is_err());
    }

    #[test]
    fn test_envelope_rejects_non_object_reply() {
        let err = envelope("[1]").unwrap_err().to_string();
        assert!(err.contains("unexpected reply"));
        assert!(envelope("\"ok\"").is_err());
    }

    #[test]
    fn test_envelope_success_without_data() {
        assert_eq!(envelope(r#"{"status":200}"#).unwrap(), Value::Null);
    }

    #[test]
    fn test_cli_parses_nested_unknown() {
        let cli = Cli::try_parse_from(["presence", "unknown", "review", "7", "--status", "ignored"])
            .unwrap();
        match cli.command {
            Commands::Unknown(UnknownCommands::Review { id, status, notes }) => {
                assert_eq!(id, 7);
                assert_eq!(status, "ignored");
                assert!(notes.is_none());
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
