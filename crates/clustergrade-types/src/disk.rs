//! Free disk space on the filesystems holding the cluster's directories.
//!
//! Both the hub (for the coordinator) and the agents (for segment hosts)
//! read `df -P -k` output and compare each filesystem's free ratio against
//! the `disk_free_ratio` requested at initialize.

use std::fmt;

use thiserror::Error;

/// `df -P -k` arguments preceding the directories to inspect.
pub const DF_ARGS: [&str; 2] = ["-P", "-k"];

/// One filesystem line of `df -P -k` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    pub filesystem: String,
    pub mount: String,
    pub used_kb: u64,
    pub available_kb: u64,
}

impl DiskUsage {
    /// Fraction of the filesystem still free, as `df` computes capacity.
    pub fn free_ratio(&self) -> f64 {
        let usable = self.used_kb + self.available_kb;
        if usable == 0 {
            return 0.0;
        }
        self.available_kb as f64 / usable as f64
    }
}

impl fmt::Display for DiskUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) has {:.0}% free, {} KiB available",
            self.mount,
            self.filesystem,
            self.free_ratio() * 100.0,
            self.available_kb
        )
    }
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unexpected df output line {0:?}")]
    Parse(String),

    #[error("not enough free disk space on {host}, {required:.0}% required: {filesystems}")]
    Insufficient {
        host: String,
        required: f64,
        filesystems: String,
    },
}

/// Parse `df -P -k` output, one entry per distinct mount point.
pub fn parse_df(output: &str) -> Result<Vec<DiskUsage>, DiskError> {
    let mut usages: Vec<DiskUsage> = Vec::new();
    for line in output.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(DiskError::Parse(line.to_string()));
        }
        let number = |s: &str| s.parse::<u64>().map_err(|_| DiskError::Parse(line.to_string()));
        let usage = DiskUsage {
            filesystem: fields[0].to_string(),
            used_kb: number(fields[2])?,
            available_kb: number(fields[3])?,
            mount: fields[5..].join(" "),
        };
        if !usages.iter().any(|u| u.mount == usage.mount) {
            usages.push(usage);
        }
    }
    Ok(usages)
}

/// Fail when any filesystem on `host` has less than `required` of its space
/// free. A ratio of zero disables the check.
pub fn check_free_ratio(host: &str, usages: &[DiskUsage], required: f64) -> Result<(), DiskError> {
    if required <= 0.0 {
        return Ok(());
    }
    let short: Vec<String> = usages
        .iter()
        .filter(|usage| usage.free_ratio() < required)
        .map(DiskUsage::to_string)
        .collect();
    if short.is_empty() {
        return Ok(());
    }
    Err(DiskError::Insufficient {
        host: host.to_string(),
        required: required * 100.0,
        filesystems: short.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DF: &str = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/sda1        104857600  94371840  10485760      90% /data
/dev/sda1        104857600  94371840  10485760      90% /data
/dev/sdb1         52428800   5242880  47185920      10% /data mirror
";

    #[test]
    fn df_output_is_parsed_once_per_mount() {
        let usages = parse_df(DF).unwrap();
        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].mount, "/data");
        assert_eq!(usages[1].mount, "/data mirror");
        assert!((usages[0].free_ratio() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn garbage_lines_are_rejected() {
        let err = parse_df("Filesystem ...\nnot a df line\n").unwrap_err();
        assert!(matches!(err, DiskError::Parse(line) if line == "not a df line"));
    }

    #[test]
    fn short_filesystems_are_reported() {
        let usages = parse_df(DF).unwrap();
        let err = check_free_ratio("sdw1", &usages, 0.2).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sdw1"));
        assert!(message.contains("20% required"));
        assert!(message.contains("/data (/dev/sda1) has 10% free"));
        assert!(!message.contains("/dev/sdb1"));

        check_free_ratio("sdw1", &usages, 0.05).unwrap();
        check_free_ratio("sdw1", &usages, 0.0).unwrap();
    }
}
