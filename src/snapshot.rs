// src/snapshot.rs

//! Snapshot model and the external snapshot source
//!
//! Snapshots are created and deleted by snapper; this crate only observes
//! them and reacts. The one exception is the `important` flag: a post
//! snapshot inherits its paired pre snapshot's flag at creation time, and
//! that forwarding happens here so the reconciler never has to re-run the
//! important-package check for the post.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Command;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

/// Snapshot type as recorded by snapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Single,
    Pre,
    Post,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &str {
        match self {
            SnapshotKind::Single => "single",
            SnapshotKind::Pre => "pre",
            SnapshotKind::Post => "post",
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(SnapshotKind::Single),
            "pre" => Ok(SnapshotKind::Pre),
            "post" => Ok(SnapshotKind::Post),
            _ => Err(Error::ParseError(format!("Invalid snapshot type: {}", s))),
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapper snapshot as observed by this crate
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub number: u64,
    pub kind: SnapshotKind,
    /// Back-reference to the paired pre snapshot (post snapshots only)
    pub pre_number: Option<u64>,
    pub date: Option<NaiveDateTime>,
    pub user: String,
    pub description: String,
    pub cleanup_algorithm: String,
    pub userdata: BTreeMap<String, String>,
}

impl Snapshot {
    /// Whether snapper userdata marks this snapshot important.
    pub fn important(&self) -> bool {
        self.userdata.get("important").is_some_and(|value| value == "yes")
    }
}

/// External snapshot manager interface. The engine reads existence and
/// metadata; creation is only triggered on behalf of the command surface.
pub trait SnapshotSource: Send + Sync {
    /// All snapshots currently known to the manager.
    fn list(&self) -> Result<Vec<Snapshot>>;

    /// A single snapshot by number.
    fn get(&self, number: u64) -> Result<Snapshot>;

    /// Create a snapshot, returning its number. For `Post`, the important
    /// flag is taken from the paired pre snapshot and `important` is ignored.
    fn create(&self, kind: SnapshotKind, important: bool) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct SnapperListEntry {
    number: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "pre-number", default)]
    pre_number: Option<u64>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    cleanup: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    userdata: Option<BTreeMap<String, String>>,
}

/// Snapshot source backed by the snapper command line tool (`--jsonout`).
pub struct SnapperCli {
    config_name: String,
    cleanup_algorithm: String,
    description: String,
    /// Pre snapshot created by this process and still awaiting its post.
    /// Only a cache: hooks run pre and post in separate processes, so the
    /// post path recovers the open pre from the snapshot list when this is
    /// empty.
    pre_number: Mutex<Option<u64>>,
}

/// Pairing decision for a post snapshot: the pre it belongs to and the
/// important flag it inherits. `remembered` wins when set; otherwise the
/// newest pre snapshot no post references yet is recovered from
/// `snapshots`, so pairing survives across separate hook invocations.
fn post_pairing(snapshots: &[Snapshot], remembered: Option<u64>) -> Result<(u64, bool)> {
    let pre = remembered.or_else(|| {
        let paired: BTreeSet<u64> = snapshots
            .iter()
            .filter(|snapshot| snapshot.kind == SnapshotKind::Post)
            .filter_map(|snapshot| snapshot.pre_number)
            .collect();

        snapshots
            .iter()
            .filter(|snapshot| {
                snapshot.kind == SnapshotKind::Pre && !paired.contains(&snapshot.number)
            })
            .map(|snapshot| snapshot.number)
            .max()
    });

    let pre = pre.ok_or_else(|| {
        Error::NotFound("No pre-snapshot to pair a post-snapshot with".to_string())
    })?;

    // A remembered pre that vanished mid-transaction forwards false, the
    // safe default.
    let important = snapshots
        .iter()
        .find(|snapshot| snapshot.number == pre)
        .map(Snapshot::important)
        .unwrap_or(false);

    Ok((pre, important))
}

impl SnapperCli {
    pub fn new(config_name: &str, cleanup_algorithm: &str, description: &str) -> Self {
        Self {
            config_name: config_name.to_string(),
            cleanup_algorithm: cleanup_algorithm.to_string(),
            description: description.to_string(),
            pre_number: Mutex::new(None),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("snapper")
            .arg("-c")
            .arg(&self.config_name)
            .arg("--jsonout")
            .args(args)
            .output()
            .map_err(|e| Error::ExternalFailure(format!("Failed to run snapper: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ExternalFailure(format!(
                "snapper {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn parse_list(&self, buffer: &str) -> Result<Vec<Snapshot>> {
        let mut output: HashMap<String, Vec<SnapperListEntry>> = serde_json::from_str(buffer)?;
        let entries = output.remove(&self.config_name).ok_or_else(|| {
            Error::ParseError(format!("snapper list has no config {}", self.config_name))
        })?;

        entries
            .into_iter()
            // Snapshot 0 is the live system, not a real snapshot.
            .filter(|entry| entry.number != 0)
            .map(|entry| {
                Ok(Snapshot {
                    number: entry.number,
                    kind: entry.kind.parse()?,
                    pre_number: entry.pre_number,
                    date: entry.date.as_deref().and_then(|date| {
                        NaiveDateTime::parse_from_str(date, "%Y-%m-%d %H:%M:%S").ok()
                    }),
                    user: entry.user,
                    description: entry.description,
                    cleanup_algorithm: entry.cleanup,
                    userdata: entry.userdata.unwrap_or_default(),
                })
            })
            .collect()
    }

    fn create_with(&self, args: &[&str]) -> Result<u64> {
        let stdout = self.run(args)?;
        // `create --print-number` prints the bare number, with or without
        // --jsonout depending on the snapper version.
        let trimmed = stdout.trim().trim_matches('"');
        trimmed
            .parse::<u64>()
            .map_err(|_| Error::ParseError(format!("snapper returned no snapshot number: {}", trimmed)))
    }
}

impl SnapshotSource for SnapperCli {
    fn list(&self) -> Result<Vec<Snapshot>> {
        let buffer = self.run(&["list", "--columns", "number,type,pre-number,date,user,cleanup,description,userdata"])?;
        self.parse_list(&buffer)
    }

    fn get(&self, number: u64) -> Result<Snapshot> {
        self.list()?
            .into_iter()
            .find(|snapshot| snapshot.number == number)
            .ok_or_else(|| Error::NotFound(format!("Snapshot {} not found", number)))
    }

    fn create(&self, kind: SnapshotKind, important: bool) -> Result<u64> {
        let mut pre_number = self.pre_number.lock().unwrap();

        let number = match kind {
            SnapshotKind::Pre => {
                // An unpaired pre snapshot is reused rather than stacked.
                if let Some(number) = *pre_number {
                    return Ok(number);
                }

                let userdata = if important { "important=yes" } else { "important=no" };
                let number = self.create_with(&[
                    "create",
                    "--type",
                    "pre",
                    "--print-number",
                    "--description",
                    &self.description,
                    "--cleanup-algorithm",
                    &self.cleanup_algorithm,
                    "--userdata",
                    userdata,
                ])?;
                *pre_number = Some(number);
                number
            }
            SnapshotKind::Post => {
                let snapshots = self.list()?;
                let (pre, inherited) = post_pairing(&snapshots, pre_number.take())?;

                // The post snapshot inherits the pre snapshot's flag.
                let userdata = if inherited { "important=yes" } else { "important=no" };
                self.create_with(&[
                    "create",
                    "--type",
                    "post",
                    "--pre-number",
                    &pre.to_string(),
                    "--print-number",
                    "--cleanup-algorithm",
                    &self.cleanup_algorithm,
                    "--userdata",
                    userdata,
                ])?
            }
            SnapshotKind::Single => {
                let userdata = if important { "important=yes" } else { "important=no" };
                self.create_with(&[
                    "create",
                    "--type",
                    "single",
                    "--print-number",
                    "--description",
                    &self.description,
                    "--cleanup-algorithm",
                    &self.cleanup_algorithm,
                    "--userdata",
                    userdata,
                ])?
            }
        };

        info!(number, kind = %kind, "Created snapshot");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> SnapperCli {
        SnapperCli::new("root", "number", "snapboot")
    }

    fn listed(number: u64, kind: SnapshotKind, pre_number: Option<u64>, important: bool) -> Snapshot {
        let mut userdata = BTreeMap::new();
        userdata.insert("important".to_string(), if important { "yes" } else { "no" }.to_string());
        Snapshot {
            number,
            kind,
            pre_number,
            date: None,
            user: "root".to_string(),
            description: String::new(),
            cleanup_algorithm: "number".to_string(),
            userdata,
        }
    }

    #[test]
    fn parses_snapper_list_output() {
        let buffer = r#"{
            "root": [
                {"number": 0, "default": true, "active": true, "type": "single",
                 "pre-number": null, "date": null, "user": "root",
                 "cleanup": "", "description": "current", "userdata": null},
                {"number": 10, "default": false, "active": false, "type": "pre",
                 "pre-number": null, "date": "2024-05-01 12:00:00", "user": "root",
                 "cleanup": "number", "description": "pacman -Syu",
                 "userdata": {"important": "yes"}},
                {"number": 11, "default": false, "active": false, "type": "post",
                 "pre-number": 10, "date": "2024-05-01 12:05:00", "user": "root",
                 "cleanup": "number", "description": "", "userdata": null}
            ]
        }"#;

        let snapshots = cli().parse_list(buffer).unwrap();
        assert_eq!(snapshots.len(), 2, "snapshot 0 must be filtered out");
        assert_eq!(snapshots[0].number, 10);
        assert_eq!(snapshots[0].kind, SnapshotKind::Pre);
        assert!(snapshots[0].important());
        assert_eq!(snapshots[1].pre_number, Some(10));
        assert!(!snapshots[1].important());
        assert!(snapshots[0].date.is_some());
    }

    #[test]
    fn missing_config_is_a_parse_error() {
        let result = cli().parse_list(r#"{"home": []}"#);
        assert!(matches!(result, Err(Error::ParseError(_))));
    }

    #[test]
    fn invalid_snapshot_type_is_rejected() {
        let buffer = r#"{"root": [{"number": 1, "type": "weird", "user": "root"}]}"#;
        assert!(cli().parse_list(buffer).is_err());
    }

    #[test]
    fn post_recovers_open_pre_from_list() {
        // A fresh process has nothing remembered; the newest pre snapshot
        // no post references yet is the one to pair with.
        let snapshots = vec![
            listed(10, SnapshotKind::Pre, None, false),
            listed(11, SnapshotKind::Post, Some(10), false),
            listed(12, SnapshotKind::Pre, None, true),
        ];
        assert_eq!(post_pairing(&snapshots, None).unwrap(), (12, true));
    }

    #[test]
    fn post_inherits_important_flag_from_its_pre() {
        let snapshots = vec![listed(10, SnapshotKind::Pre, None, true)];
        assert_eq!(post_pairing(&snapshots, Some(10)).unwrap(), (10, true));

        let snapshots = vec![listed(10, SnapshotKind::Pre, None, false)];
        assert_eq!(post_pairing(&snapshots, Some(10)).unwrap(), (10, false));
    }

    #[test]
    fn post_without_open_pre_is_not_found() {
        let snapshots = vec![
            listed(10, SnapshotKind::Pre, None, false),
            listed(11, SnapshotKind::Post, Some(10), false),
        ];
        assert!(matches!(post_pairing(&snapshots, None), Err(Error::NotFound(_))));
        assert!(matches!(post_pairing(&[], None), Err(Error::NotFound(_))));
    }

    #[test]
    fn important_flag_requires_yes() {
        let mut userdata = BTreeMap::new();
        userdata.insert("important".to_string(), "no".to_string());
        let snapshot = Snapshot {
            number: 1,
            kind: SnapshotKind::Single,
            pre_number: None,
            date: None,
            user: "root".to_string(),
            description: String::new(),
            cleanup_algorithm: "number".to_string(),
            userdata,
        };
        assert!(!snapshot.important());
    }
}
