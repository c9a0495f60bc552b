use std::path::Path;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use which::which;
use crate::error::{BackupError, Result};
use crate::service::mongo::coordinator::AttemptLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub collections: u64,
    pub documents: u64,
    pub indexes: u64,
}

#[derive(Debug, Clone)]
pub struct DumpOutput {
    pub success: bool,
    pub output: String,
}

pub fn create_command(uri: &str, target_dir: &Path) -> Result<Command> {
    let command_path = which("mongodump")
        .map_err(|e| BackupError::Execution(format!("mongodump not found: {}", e)))?;
    let mut cmd = Command::new(command_path);
    cmd.arg(format!("--uri={}", uri));
    cmd.arg(format!("--out={}", target_dir.to_str().unwrap()));
    // Read from a secondary and copy one collection at a time to keep the
    // load on the source down.
    cmd.arg("--readPreference=secondary");
    cmd.arg("--numParallelCollections=1");
    Ok(cmd)
}

#[async_trait]
pub trait DumpRunner: Send + Sync {
    async fn run_dump(&self, target_dir: &Path, log: &mut AttemptLog) -> Result<DumpOutput>;
}

pub struct MongoDump {
    uri: String,
}

impl MongoDump {
    pub fn new(uri: &str) -> MongoDump {
        MongoDump {
            uri: uri.to_string(),
        }
    }
}

#[async_trait]
impl DumpRunner for MongoDump {
    async fn run_dump(&self, target_dir: &Path, log: &mut AttemptLog) -> Result<DumpOutput> {
        let mut cmd = create_command(&self.uri, target_dir)?;
        log.push(&format!("Dumping into {}.", target_dir.display()));

        // Blocks this attempt until mongodump is done; combined output is the
        // only channel for per-collection stats.
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::Execution(format!("failed to launch mongodump: {}", e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        if output.status.success() {
            log.push("-> Dumped!");
        } else {
            log.push("-> Failed to dump!");
        }

        Ok(DumpOutput {
            success: output.status.success(),
            output: combined,
        })
    }
}

// mongodump reports per-collection progress on stderr. The counters are best
// effort: missing or unrecognized lines simply leave them at zero.
pub fn parse_dump_stats(output: &str) -> DumpStats {
    let documents_re = Regex::new(r"done dumping .+ \((\d+) documents?\)").unwrap();
    let indexes_re = Regex::new(r"(\d+) index(?:es)?\b").unwrap();

    let mut stats = DumpStats::default();
    for capture in documents_re.captures_iter(output) {
        stats.collections += 1;
        if let Ok(count) = capture[1].parse::<u64>() {
            stats.documents += count;
        }
    }
    for capture in indexes_re.captures_iter(output) {
        if let Ok(count) = capture[1].parse::<u64>() {
            stats.indexes += count;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats_from_dump_output() {
        let output = "\
2024-03-01T06:00:00.000+0100\twriting appdb.users to /backups/daily/x/appdb/users.bson
2024-03-01T06:00:01.000+0100\tdone dumping appdb.users (1500 documents)
2024-03-01T06:00:01.200+0100\twriting appdb.orders to /backups/daily/x/appdb/orders.bson
2024-03-01T06:00:02.000+0100\tdone dumping appdb.orders (25 documents)
2024-03-01T06:00:02.100+0100\tdone dumping appdb.sessions (1 document)";

        let stats = parse_dump_stats(output);
        assert_eq!(stats.collections, 3);
        assert_eq!(stats.documents, 1526);
        assert_eq!(stats.indexes, 0);
    }

    #[test]
    fn test_parse_stats_counts_indexes() {
        let output = "\
2024-03-01T06:00:01.000+0100\tdone dumping appdb.users (10 documents)
2024-03-01T06:00:01.100+0100\tdumped 3 indexes for appdb.users";

        let stats = parse_dump_stats(output);
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.documents, 10);
        assert_eq!(stats.indexes, 3);
    }

    #[test]
    fn test_parse_stats_tolerates_unrelated_output() {
        let stats = parse_dump_stats("error connecting to the replica set");
        assert_eq!(stats, DumpStats::default());
    }
}
