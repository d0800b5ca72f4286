use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde_json::{Map, Value};

use crate::config::NodeIdentity;
use crate::decoder::KeyDecoder;

pub const SINK_NODE_KEY: &str = "sink_node";
pub const SINK_CLUSTER_KEY: &str = "sink_cluster";
pub const SINK_ZONE_KEY: &str = "sink_zone";
pub const SINK_REGION_KEY: &str = "sink_region";
pub const SINK_PROVIDER_KEY: &str = "sink_provider";
pub const SINK_TIME_KEY: &str = "sink_time";
pub const SINK_NAME_KEY: &str = "sink_name";
pub const SINK_VALUE_KEY: &str = "sink_value";

/// Read access to the kernel maps of loaded programs.
pub trait TableSource: Send + Sync {
    /// Raw `(key, value)` entries of one map, keys `key_size` bytes wide.
    fn table_entries(
        &self,
        program: &str,
        table: &str,
        key_size: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// program -> function -> tag of every attached probe.
    fn program_tags(&self) -> BTreeMap<String, BTreeMap<String, u64>>;
}

/// A decoded row of a kernel map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricValue {
    /// Key bytes as hex, for the debug dump.
    pub raw: String,
    pub labels: Vec<String>,
    pub value: u64,
}

#[derive(Debug, Default)]
pub struct TableScan {
    pub rows: Vec<MetricValue>,
    /// One serialized record per non-zero row.
    pub sink_records: Vec<String>,
}

/// Host-order map value: u64 counters, or u32 for narrow maps.
pub fn parse_value(raw: &[u8]) -> Result<u64> {
    if let Ok(bytes) = <[u8; 8]>::try_from(raw) {
        return Ok(u64::from_ne_bytes(bytes));
    }
    if let Ok(bytes) = <[u8; 4]>::try_from(raw) {
        return Ok(u64::from(u32::from_ne_bytes(bytes)));
    }
    bail!("unsupported value width {}", raw.len())
}

fn raw_key(key: &[u8]) -> String {
    let mut raw = String::with_capacity(2 + key.len() * 2);
    raw.push_str("0x");
    for byte in key {
        raw.push_str(&format!("{byte:02x}"));
    }
    raw
}

/// Decodes whole tables into rows and their sink records.
pub struct TableScanner {
    node: NodeIdentity,
}

impl TableScanner {
    pub fn new(node: NodeIdentity) -> Self {
        Self { node }
    }

    /// Scan one table. Rows a decoder skipped are left out entirely; any
    /// other decoding failure fails the whole table.
    pub fn scan(
        &self,
        source: &dyn TableSource,
        program: &str,
        table: &str,
        keys: &KeyDecoder,
        now: DateTime<Local>,
    ) -> Result<TableScan> {
        let entries = source
            .table_entries(program, table, keys.key_size())
            .with_context(|| format!("reading table {table:?} of program {program:?}"))?;
        let names = keys.label_names();
        let timestamp = now.timestamp_nanos_opt().unwrap_or_default();

        let mut scan = TableScan::default();
        for (key, value) in entries {
            let Some(labels) = keys
                .decode(&key)
                .with_context(|| format!("decoding key {} of table {table:?}", raw_key(&key)))?
            else {
                continue;
            };
            let value = parse_value(&value)
                .with_context(|| format!("reading value of table {table:?}"))?;

            if value != 0 {
                scan.sink_records
                    .push(self.sink_record(table, &names, &labels, value, timestamp)?);
            }
            scan.rows.push(MetricValue {
                raw: raw_key(&key),
                labels,
                value,
            });
        }
        Ok(scan)
    }

    fn sink_record(
        &self,
        table: &str,
        names: &[String],
        labels: &[String],
        value: u64,
        timestamp: i64,
    ) -> Result<String> {
        let mut record = Map::new();
        for (name, label) in names.iter().zip(labels) {
            record.insert(name.clone(), Value::from(label.as_str()));
        }
        let node = &self.node;
        for (key, value) in [
            (SINK_NODE_KEY, &node.node),
            (SINK_CLUSTER_KEY, &node.cluster),
            (SINK_ZONE_KEY, &node.zone),
            (SINK_REGION_KEY, &node.region),
            (SINK_PROVIDER_KEY, &node.provider),
        ] {
            record.insert(key.to_string(), Value::from(value.as_str()));
        }
        record.insert(SINK_TIME_KEY.to_string(), Value::from(timestamp));
        record.insert(SINK_NAME_KEY.to_string(), Value::from(table));
        record.insert(SINK_VALUE_KEY.to_string(), Value::from(value));
        serde_json::to_string(&Value::Object(record)).context("serializing sink record")
    }
}
