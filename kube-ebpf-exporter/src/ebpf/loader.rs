use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use aya::maps::{Array, HashMap as BpfHashMap, Map};
use aya::programs::{KProbe, RawTracePoint, TracePoint};
use aya::Ebpf;

use crate::config::Program;
use crate::scanner::TableSource;

/// Loaded and attached eBPF objects, one per configured program.
pub struct EbpfLoader {
    programs: HashMap<String, Mutex<Ebpf>>,
    tags: BTreeMap<String, BTreeMap<String, u64>>,
}

impl EbpfLoader {
    /// Load every program's object and attach its probes.
    ///
    /// Any failure is fatal: a half-attached exporter would report
    /// misleading data.
    pub fn load(programs: &[Program]) -> Result<Self> {
        let mut loaded = HashMap::new();
        let mut tags = BTreeMap::new();

        for program in programs {
            if loaded.contains_key(&program.name) {
                bail!("multiple programs with name {:?}", program.name);
            }
            let mut bpf = Ebpf::load_file(&program.object).with_context(|| {
                format!(
                    "loading {} for program {:?}",
                    program.object.display(),
                    program.name
                )
            })?;
            let program_tags = attach(&mut bpf, program)
                .with_context(|| format!("attaching program {:?}", program.name))?;
            log::info!(
                "attached program {:?} ({} probes)",
                program.name,
                program_tags.len()
            );
            tags.insert(program.name.clone(), program_tags);
            loaded.insert(program.name.clone(), Mutex::new(bpf));
        }

        Ok(Self {
            programs: loaded,
            tags,
        })
    }
}

/// Attach kprobes, kretprobes, tracepoints and raw tracepoints, returning
/// the tag of each attached function.
fn attach(bpf: &mut Ebpf, program: &Program) -> Result<BTreeMap<String, u64>> {
    let mut tags = BTreeMap::new();

    for (target, function) in program.kprobes.iter().chain(&program.kretprobes) {
        let prog: &mut KProbe = bpf
            .program_mut(function)
            .with_context(|| format!("{function} not found in object"))?
            .try_into()
            .with_context(|| format!("{function} is not a kprobe"))?;
        prog.load().with_context(|| format!("loading {function}"))?;
        prog.attach(target, 0)
            .with_context(|| format!("attaching {function} to {target}"))?;
        tags.insert(function.clone(), prog.info()?.tag());
    }

    for (target, function) in &program.tracepoints {
        let Some((category, name)) = target.split_once(':') else {
            bail!("tracepoint {target:?} must be category:name");
        };
        let prog: &mut TracePoint = bpf
            .program_mut(function)
            .with_context(|| format!("{function} not found in object"))?
            .try_into()
            .with_context(|| format!("{function} is not a tracepoint"))?;
        prog.load().with_context(|| format!("loading {function}"))?;
        prog.attach(category, name)
            .with_context(|| format!("attaching {function} to {target}"))?;
        tags.insert(function.clone(), prog.info()?.tag());
    }

    for (target, function) in &program.raw_tracepoints {
        let prog: &mut RawTracePoint = bpf
            .program_mut(function)
            .with_context(|| format!("{function} not found in object"))?
            .try_into()
            .with_context(|| format!("{function} is not a raw tracepoint"))?;
        prog.load().with_context(|| format!("loading {function}"))?;
        prog.attach(target)
            .with_context(|| format!("attaching {function} to {target}"))?;
        tags.insert(function.clone(), prog.info()?.tag());
    }

    Ok(tags)
}

fn hash_entries<const N: usize>(map: &Map) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let hash = BpfHashMap::<_, [u8; N], u64>::try_from(map)?;
    hash.iter()
        .map(|entry| {
            let (key, value) = entry?;
            Ok((key.to_vec(), value.to_ne_bytes().to_vec()))
        })
        .collect()
}

fn array_entries(map: &Map) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let array = Array::<_, u64>::try_from(map)?;
    array
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let index = u32::try_from(index).context("array index overflow")?;
            Ok((index.to_ne_bytes().to_vec(), value?.to_ne_bytes().to_vec()))
        })
        .collect()
}

/// Hash keys are fixed-size arrays, so dispatch on the configured width.
macro_rules! hash_entries_by_size {
    ($map:expr, $size:expr, [$($n:literal),*]) => {
        match $size {
            $($n => hash_entries::<$n>($map),)*
            other => bail!("unsupported key size {other}"),
        }
    };
}

impl TableSource for EbpfLoader {
    fn table_entries(
        &self,
        program: &str,
        table: &str,
        key_size: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let bpf = self
            .programs
            .get(program)
            .with_context(|| format!("program {program:?} is not loaded"))?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let map = bpf
            .map(table)
            .with_context(|| format!("map {table:?} not found"))?;

        match map {
            Map::Array(_) if key_size == 4 => array_entries(map),
            Map::Array(_) => bail!("array {table:?} has 4-byte keys, labels expect {key_size}"),
            _ => hash_entries_by_size!(
                map,
                key_size,
                [
                    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21,
                    22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40,
                    41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59,
                    60, 61, 62, 63, 64
                ]
            ),
        }
    }

    fn program_tags(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.tags.clone()
    }
}
