use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType,
};

use crate::config::{Config, Label, NodeIdentity, SinkMode};
use crate::data::histogram::{self, HistogramGroups, HistogramSpec, HistogramSnapshot};
use crate::decoder::{DecoderContext, KeyDecoder};
use crate::scanner::{TableScanner, TableSource};
use crate::sink::SinkExporter;

/// Prefix of every metric this exporter reports.
pub const NAMESPACE: &str = "ebpf_exporter";
const NODE_ID_LABEL: &str = "node_id";

struct CounterMetric {
    desc: Desc,
    table: String,
    keys: KeyDecoder,
    sink_mode: SinkMode,
}

struct HistogramMetric {
    desc: Desc,
    table: String,
    keys: KeyDecoder,
    spec: HistogramSpec,
}

struct ProgramMetrics {
    name: String,
    counters: Vec<CounterMetric>,
    histograms: Vec<HistogramMetric>,
}

impl ProgramMetrics {
    /// Every table this program reads, with the key layout to read it with.
    fn tables(&self) -> BTreeMap<&str, &KeyDecoder> {
        let counters = self.counters.iter().map(|c| (c.table.as_str(), &c.keys));
        let histograms = self.histograms.iter().map(|h| (h.table.as_str(), &h.keys));
        counters.chain(histograms).collect()
    }
}

/// Turns the kernel maps of every configured program into metric families,
/// spooling counter samples to the sink as configured.
pub struct Exporter {
    programs: Vec<ProgramMetrics>,
    source: Arc<dyn TableSource>,
    scanner: TableScanner,
    sink: Option<SinkExporter>,
    enabled_programs: Desc,
    program_info: Desc,
}

fn desc(name: &str, help: &str, labels: Vec<String>, node_id: &str) -> Result<Desc> {
    let help = if help.is_empty() { name } else { help };
    Desc::new(
        format!("{NAMESPACE}_{name}"),
        help.to_string(),
        labels,
        HashMap::from([(NODE_ID_LABEL.to_string(), node_id.to_string())]),
    )
    .with_context(|| format!("describing metric {name:?}"))
}

fn label_names(labels: &[Label]) -> Vec<String> {
    labels.iter().map(|l| l.name.clone()).collect()
}

impl Exporter {
    pub fn new(
        config: &Config,
        node: NodeIdentity,
        ctx: &DecoderContext,
        source: Arc<dyn TableSource>,
        sink: Option<SinkExporter>,
    ) -> Result<Self> {
        let node_id = node.node.clone();
        let mut names = HashSet::new();
        let mut programs = Vec::with_capacity(config.programs.len());

        for program in &config.programs {
            let mut metrics = ProgramMetrics {
                name: program.name.clone(),
                counters: Vec::new(),
                histograms: Vec::new(),
            };
            for counter in &program.metrics.counters {
                if !names.insert(counter.name.as_str()) {
                    bail!("metric {:?} is declared more than once", counter.name);
                }
                let keys = KeyDecoder::build(&counter.labels, ctx).with_context(|| {
                    format!("counter {:?} of program {:?}", counter.name, program.name)
                })?;
                let labels = label_names(&counter.labels);
                metrics.counters.push(CounterMetric {
                    desc: desc(&counter.name, &counter.help, labels, &node_id)?,
                    table: counter.table.clone(),
                    keys,
                    sink_mode: counter.sink_mode,
                });
            }
            for hist in &program.metrics.histograms {
                if !names.insert(hist.name.as_str()) {
                    bail!("metric {:?} is declared more than once", hist.name);
                }
                let context = || format!("histogram {:?} of program {:?}", hist.name, program.name);
                let spec = HistogramSpec::from(hist);
                histogram::validate(&spec).with_context(context)?;
                let keys = KeyDecoder::build(&hist.labels, ctx).with_context(context)?;
                // The last label is the bucket, not a series label.
                let series = &hist.labels[..hist.labels.len().saturating_sub(1)];
                metrics.histograms.push(HistogramMetric {
                    desc: desc(&hist.name, &hist.help, label_names(series), &node_id)?,
                    table: hist.table.clone(),
                    keys,
                    spec,
                });
            }
            programs.push(metrics);
        }

        Ok(Self {
            programs,
            source,
            scanner: TableScanner::new(node),
            sink,
            enabled_programs: desc(
                "enabled_programs",
                "The set of enabled programs",
                vec!["name".to_string()],
                &node_id,
            )?,
            program_info: desc(
                "ebpf_programs",
                "Info about ebpf programs",
                vec!["program".to_string(), "function".to_string(), "tag".to_string()],
                &node_id,
            )?,
        })
    }

    /// Gather every non-empty family once, dumping sink records at the end.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let now = Local::now();
        let mut families = vec![self.enabled_programs_family(), self.program_info_family()];
        let mut sink_records = Vec::new();

        for program in &self.programs {
            for counter in &program.counters {
                let family = self.collect_counter(program, counter, now, &mut sink_records);
                families.extend(family);
            }
            for histogram in &program.histograms {
                if let Some(family) = self.collect_histogram(program, histogram, now) {
                    families.push(family);
                }
            }
        }

        if let Some(sink) = &self.sink {
            sink.dump_at(&sink_records, now);
        }
        families.retain(|f| !f.get_metric().is_empty());
        families
    }

    fn enabled_programs_family(&self) -> MetricFamily {
        let metrics = self
            .programs
            .iter()
            .map(|p| gauge_metric(&self.enabled_programs, &[p.name.clone()], 1.0))
            .collect();
        family(&self.enabled_programs, MetricType::GAUGE, metrics)
    }

    fn program_info_family(&self) -> MetricFamily {
        let mut metrics = Vec::new();
        for (program, tags) in self.source.program_tags() {
            for (function, tag) in tags {
                let values = [program.clone(), function, format!("{tag:x}")];
                metrics.push(gauge_metric(&self.program_info, &values, 1.0));
            }
        }
        family(&self.program_info, MetricType::GAUGE, metrics)
    }

    fn collect_counter(
        &self,
        program: &ProgramMetrics,
        counter: &CounterMetric,
        now: DateTime<Local>,
        sink_records: &mut Vec<String>,
    ) -> Option<MetricFamily> {
        let scan = match self.scanner.scan(
            self.source.as_ref(),
            &program.name,
            &counter.table,
            &counter.keys,
            now,
        ) {
            Ok(scan) => scan,
            Err(e) => {
                log::warn!(
                    "skipping counter {:?} of program {:?}: {e:#}",
                    counter.desc.fq_name,
                    program.name
                );
                return None;
            }
        };

        if counter.sink_mode.sinks() {
            sink_records.extend(scan.sink_records);
        }
        if !counter.sink_mode.exports() {
            return None;
        }
        // Many keys (pids, truncated strings) can decode to one label set.
        let mut series: BTreeMap<Vec<String>, u64> = BTreeMap::new();
        for row in scan.rows {
            let total = series.entry(row.labels).or_insert(0);
            *total = total.saturating_add(row.value);
        }
        let metrics = series
            .iter()
            .map(|(labels, total)| {
                let mut metric = labeled_metric(&counter.desc, labels);
                let mut value = Counter::default();
                value.set_value(*total as f64);
                metric.set_counter(value);
                metric
            })
            .collect();
        Some(family(&counter.desc, MetricType::COUNTER, metrics))
    }

    fn collect_histogram(
        &self,
        program: &ProgramMetrics,
        histogram: &HistogramMetric,
        now: DateTime<Local>,
    ) -> Option<MetricFamily> {
        let scan = match self.scanner.scan(
            self.source.as_ref(),
            &program.name,
            &histogram.table,
            &histogram.keys,
            now,
        ) {
            Ok(scan) => scan,
            Err(e) => {
                log::warn!(
                    "skipping histogram {:?} of program {:?}: {e:#}",
                    histogram.desc.fq_name,
                    program.name
                );
                return None;
            }
        };

        let mut groups = HistogramGroups::default();
        for row in &scan.rows {
            groups.add(&row.labels, row.value);
        }

        let mut metrics = Vec::new();
        for (labels, snapshot) in groups.reconstruct(histogram.spec) {
            match snapshot {
                Ok(snapshot) => metrics.push(histogram_metric(&histogram.desc, &labels, snapshot)),
                Err(e) => log::warn!(
                    "skipping {labels:?} of histogram {:?} in table {:?} of program {:?}: {e:#}",
                    histogram.desc.fq_name,
                    histogram.table,
                    program.name
                ),
            }
        }
        Some(family(&histogram.desc, MetricType::HISTOGRAM, metrics))
    }

    /// Every decoded row of every table, grouped by program, for operators.
    /// Table errors are shown in place of the table's rows.
    pub fn tables_dump(&self) -> String {
        let now = Local::now();
        let mut out = String::new();
        for program in &self.programs {
            out.push_str(&format!("## Program: {}\n\n", program.name));
            for (table, keys) in program.tables() {
                out.push_str(&format!("### Table: {table}\n\n```\n"));
                match self
                    .scanner
                    .scan(self.source.as_ref(), &program.name, table, keys, now)
                {
                    Ok(scan) => {
                        for row in scan.rows {
                            out.push_str(&format!(
                                "{} ({}) -> {}\n",
                                row.raw,
                                row.labels.join(", "),
                                row.value
                            ));
                        }
                    }
                    Err(e) => out.push_str(&format!("error: {e:#}\n")),
                }
                out.push_str("```\n\n");
            }
        }
        out
    }

    fn descs(&self) -> Vec<&Desc> {
        let mut descs = vec![&self.enabled_programs, &self.program_info];
        for program in &self.programs {
            descs.extend(program.counters.iter().map(|c| &c.desc));
            descs.extend(program.histograms.iter().map(|h| &h.desc));
        }
        descs
    }
}

/// Registry handle for a shared [`Exporter`].
pub struct ExporterCollector(pub Arc<Exporter>);

impl Collector for ExporterCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0.descs()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.gather()
    }
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

/// A metric carrying the desc's const labels plus `values` for its
/// variable labels, sorted by name.
fn labeled_metric(desc: &Desc, values: &[String]) -> Metric {
    let mut pairs: Vec<LabelPair> = desc.const_label_pairs.clone();
    pairs.extend(
        desc.variable_labels
            .iter()
            .zip(values)
            .map(|(name, value)| label_pair(name, value)),
    );
    pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut metric = Metric::default();
    metric.set_label(pairs.into());
    metric
}

fn gauge_metric(desc: &Desc, values: &[String], value: f64) -> Metric {
    let mut metric = labeled_metric(desc, values);
    let mut gauge = Gauge::default();
    gauge.set_value(value);
    metric.set_gauge(gauge);
    metric
}

fn histogram_metric(desc: &Desc, values: &[String], snapshot: HistogramSnapshot) -> Metric {
    let buckets: Vec<Bucket> = snapshot
        .buckets
        .into_iter()
        .map(|(upper_bound, cumulative)| {
            let mut bucket = Bucket::default();
            bucket.set_upper_bound(upper_bound);
            bucket.set_cumulative_count(cumulative);
            bucket
        })
        .collect();
    let mut histogram = Histogram::default();
    histogram.set_sample_count(snapshot.count);
    histogram.set_sample_sum(snapshot.sum);
    histogram.set_bucket(buckets.into());

    let mut metric = labeled_metric(desc, values);
    metric.set_histogram(histogram);
    metric
}

fn family(desc: &Desc, kind: MetricType, metrics: Vec<Metric>) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(desc.fq_name.clone());
    family.set_help(desc.help.clone());
    family.set_field_type(kind);
    family.set_metric(metrics.into());
    family
}
