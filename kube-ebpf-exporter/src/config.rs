use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::data::container::ContainerIdPolicy;

/// Exporter configuration loaded from the YAML file given on the command line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// An eBPF object with the probes to attach and the metrics read from its maps.
#[derive(Debug, Clone, Deserialize)]
pub struct Program {
    pub name: String,
    /// Path to the compiled eBPF ELF object.
    pub object: PathBuf,
    #[serde(default)]
    pub metrics: Metrics,
    /// kernel function -> eBPF program name
    #[serde(default)]
    pub kprobes: BTreeMap<String, String>,
    #[serde(default)]
    pub kretprobes: BTreeMap<String, String>,
    /// "category:name" -> eBPF program name
    #[serde(default)]
    pub tracepoints: BTreeMap<String, String>,
    #[serde(default)]
    pub raw_tracepoints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub counters: Vec<Counter>,
    #[serde(default)]
    pub histograms: Vec<Histogram>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Counter {
    pub name: String,
    pub help: String,
    pub table: String,
    pub labels: Vec<Label>,
    #[serde(default)]
    pub sink_mode: SinkMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub help: String,
    pub table: String,
    pub bucket_type: BucketType,
    #[serde(default = "default_bucket_multiplier")]
    pub bucket_multiplier: f64,
    #[serde(default)]
    pub bucket_min: u64,
    pub bucket_max: u64,
    /// The last label carries the bucket key.
    pub labels: Vec<Label>,
}

fn default_bucket_multiplier() -> f64 {
    1.0
}

/// How to cut one label out of a map key and turn it into a string.
#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
    pub size: usize,
    /// Read `size` bytes without consuming them, so the next label sees
    /// the same segment.
    #[serde(default)]
    pub reuse: bool,
    #[serde(default)]
    pub decoders: Vec<DecoderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub name: String,
    #[serde(default)]
    pub static_map: Option<HashMap<String, String>>,
    #[serde(default)]
    pub regexps: Option<Vec<RegexpRule>>,
}

/// A bare pattern passes matching input through unchanged; a pattern with a
/// replacement rewrites it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RegexpRule {
    Pattern(String),
    Replace { pattern: String, replacement: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    Exp2,
    Linear,
}

/// Where the samples of a counter go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SinkModeRepr")]
pub enum SinkMode {
    /// Metrics only.
    #[default]
    None,
    /// Metrics and sink.
    IncludeExport,
    /// Sink only.
    ExcludeExport,
}

impl SinkMode {
    pub fn exports(self) -> bool {
        self != SinkMode::ExcludeExport
    }

    pub fn sinks(self) -> bool {
        self != SinkMode::None
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SinkModeRepr {
    Number(u8),
    Name(String),
}

impl TryFrom<SinkModeRepr> for SinkMode {
    type Error = String;

    fn try_from(repr: SinkModeRepr) -> Result<Self, Self::Error> {
        match repr {
            SinkModeRepr::Number(0) => Ok(SinkMode::None),
            SinkModeRepr::Number(1) => Ok(SinkMode::IncludeExport),
            SinkModeRepr::Number(2) => Ok(SinkMode::ExcludeExport),
            SinkModeRepr::Number(n) => Err(format!("unknown sink_mode {n}")),
            SinkModeRepr::Name(name) => match name.as_str() {
                "none" => Ok(SinkMode::None),
                "include_export" => Ok(SinkMode::IncludeExport),
                "exclude_export" => Ok(SinkMode::ExcludeExport),
                other => Err(format!("unknown sink_mode {other:?}")),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub container_id_policy: ContainerIdPolicy,
    /// Fall back to /proc/<pid>/comm when no container matches.
    #[serde(default = "default_true")]
    pub comm_fallback: bool,
    #[serde(default = "default_runtime_timeout")]
    pub runtime_timeout_ms: u64,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            container_id_policy: ContainerIdPolicy::default(),
            comm_fallback: true,
            runtime_timeout_ms: default_runtime_timeout(),
            proc_root: default_proc_root(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_runtime_timeout() -> u64 {
    2000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_root")]
    pub root: PathBuf,
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            root: default_sink_root(),
            event_log: default_event_log(),
        }
    }
}

fn default_sink_root() -> PathBuf {
    PathBuf::from("/var/lib/kube-ebpf-exporter/data")
}

fn default_event_log() -> PathBuf {
    PathBuf::from("/var/lib/kube-ebpf-exporter/event.dat")
}

impl Config {
    /// Load and sanity-check the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for program in &self.programs {
            if !seen.insert(program.name.as_str()) {
                bail!("multiple programs with name {:?}", program.name);
            }
            for histogram in &program.metrics.histograms {
                if histogram.labels.is_empty() {
                    bail!(
                        "histogram {:?} of program {:?} needs a bucket label",
                        histogram.name,
                        program.name
                    );
                }
                if histogram.bucket_min > histogram.bucket_max {
                    bail!(
                        "histogram {:?} of program {:?}: bucket_min is above bucket_max",
                        histogram.name,
                        program.name
                    );
                }
            }
        }
        Ok(())
    }
}

/// Where this node sits, stamped on every sink record and rotation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub cluster: String,
}

const DEFAULT_IDENTITY_VALUE: &str = "default";

impl NodeIdentity {
    /// Read provider/region/zone/cluster from the environment once.
    pub fn from_env(node: &str) -> Self {
        Self::from_lookup(node, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(node: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_IDENTITY_VALUE.to_string())
        };
        Self {
            node: node.to_string(),
            provider: value("KUBE_EBPF_NODE_PROVIDER"),
            region: value("KUBE_EBPF_NODE_REGION"),
            zone: value("KUBE_EBPF_NODE_ZONE"),
            cluster: value("KUBE_EBPF_NODE_CLUSTER"),
        }
    }

    /// `<provider>-<region>-<cluster>/node/<node>` under the sink base.
    pub fn sink_root(&self, base: &Path) -> PathBuf {
        base.join(format!("{}-{}-{}", self.provider, self.region, self.cluster))
            .join("node")
            .join(&self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
programs:
  - name: bio
    object: /opt/bpf/bio.o
    kprobes:
      blk_account_io_done: trace_req_done
    metrics:
      counters:
        - name: bio_ops_total
          help: Block IO operations
          table: io_counts
          sink_mode: 1
          labels:
            - name: pod
              size: 8
              reuse: true
              decoders:
                - name: kube_podname
            - name: namespace
              size: 8
              decoders:
                - name: kube_podnamespace
            - name: op
              size: 4
              decoders:
                - name: uint
                - name: static_map
                  static_map:
                    "1": read
                    "2": write
      histograms:
        - name: bio_latency_seconds
          help: Block IO latency
          table: io_latency
          bucket_type: exp2
          bucket_min: 1
          bucket_max: 1024
          bucket_multiplier: 0.000001
          labels:
            - name: bucket
              size: 8
              decoders:
                - name: uint
identity:
  container_id_policy: scoped
  runtime_timeout_ms: 500
"#;

    #[test]
    fn parses_full_program() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.programs.len(), 1);
        let program = &config.programs[0];
        assert_eq!(program.kprobes["blk_account_io_done"], "trace_req_done");

        let counter = &program.metrics.counters[0];
        assert_eq!(counter.sink_mode, SinkMode::IncludeExport);
        assert!(counter.labels[0].reuse);
        assert!(!counter.labels[1].reuse);
        assert_eq!(
            counter.labels[2].decoders[1].static_map.as_ref().unwrap()["2"],
            "write"
        );

        let histogram = &program.metrics.histograms[0];
        assert_eq!(histogram.bucket_type, BucketType::Exp2);
        assert_eq!(histogram.bucket_max, 1024);

        assert_eq!(config.identity.container_id_policy, ContainerIdPolicy::Scoped);
        assert_eq!(config.identity.runtime_timeout_ms, 500);
        assert!(config.identity.comm_fallback);
    }

    #[test]
    fn sink_mode_accepts_names_and_defaults_to_none() {
        let yaml = r#"
name: c
help: h
table: t
labels: []
"#;
        let counter: Counter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(counter.sink_mode, SinkMode::None);
        assert!(counter.sink_mode.exports());
        assert!(!counter.sink_mode.sinks());

        let counter: Counter =
            serde_yaml::from_str(&format!("{yaml}sink_mode: exclude_export\n")).unwrap();
        assert_eq!(counter.sink_mode, SinkMode::ExcludeExport);
        assert!(!counter.sink_mode.exports());

        assert!(serde_yaml::from_str::<Counter>(&format!("{yaml}sink_mode: 7\n")).is_err());
    }

    #[test]
    fn regexp_rules_accept_both_forms() {
        let yaml = r#"
name: regexps
regexps:
  - "^sshd$"
  - pattern: "^kworker/.*"
    replacement: kworker
"#;
        let decoder: DecoderConfig = serde_yaml::from_str(yaml).unwrap();
        let rules = decoder.regexps.unwrap();
        assert_eq!(rules[0], RegexpRule::Pattern("^sshd$".into()));
        assert_eq!(
            rules[1],
            RegexpRule::Replace {
                pattern: "^kworker/.*".into(),
                replacement: "kworker".into()
            }
        );
    }

    #[test]
    fn duplicate_program_names_are_rejected() {
        let yaml = r#"
programs:
  - name: a
    object: a.o
  - name: a
    object: b.o
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("multiple programs"));
    }

    #[test]
    fn node_identity_defaults_empty_values() {
        let identity = NodeIdentity::from_lookup("node-1", |key| match key {
            "KUBE_EBPF_NODE_PROVIDER" => Some("aws".into()),
            "KUBE_EBPF_NODE_REGION" => Some("".into()),
            _ => None,
        });
        assert_eq!(identity.provider, "aws");
        assert_eq!(identity.region, "default");
        assert_eq!(identity.cluster, "default");
        assert_eq!(
            identity.sink_root(Path::new("/spool")),
            PathBuf::from("/spool/aws-default-default/node/node-1")
        );
    }
}
