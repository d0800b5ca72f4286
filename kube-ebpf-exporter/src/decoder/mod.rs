//! Turning raw map-key bytes into label strings.
//!
//! Every label owns a chain of decoders built once from config. Each step
//! consumes the previous step's output; any step may skip the whole key.

pub mod inet_ip;
pub mod ksym;
pub mod kube;
pub mod regexps;
pub mod scalar;
pub mod static_map;

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::{DecoderConfig, Label};
use crate::data::kube_context::IdentityCache;
use ksym::Ksyms;
use kube::{KubeDecoder, KubeField};
use regexps::Regexps;
use static_map::StaticMap;

/// Outcome of one decoding step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Value(Vec<u8>),
    /// Drop the whole label set this key belongs to.
    Skip,
}

/// Shared state decoders may need.
#[derive(Clone)]
pub struct DecoderContext {
    pub identity: Arc<IdentityCache>,
    pub ksyms: Arc<Ksyms>,
}

pub enum Decoder {
    InetIp,
    StaticMap(StaticMap),
    Regexps(Regexps),
    String,
    Uint,
    Ksym(Arc<Ksyms>),
    MajorMinor,
    Kube(KubeDecoder),
}

impl Decoder {
    pub fn build(conf: &DecoderConfig, ctx: &DecoderContext) -> Result<Self> {
        let kube = |field| Decoder::Kube(KubeDecoder::new(field, ctx.identity.clone()));
        Ok(match conf.name.as_str() {
            "inet_ip" => Decoder::InetIp,
            "static_map" => match &conf.static_map {
                Some(mapping) => Decoder::StaticMap(StaticMap::new(mapping.clone())),
                None => bail!("static_map decoder without a static_map"),
            },
            "regexps" => Decoder::Regexps(Regexps::compile(
                conf.regexps.as_deref().unwrap_or_default(),
            )?),
            "string" => Decoder::String,
            "uint" => Decoder::Uint,
            "ksym" => Decoder::Ksym(ctx.ksyms.clone()),
            "majorminor" => Decoder::MajorMinor,
            "kube_podnamespace" => kube(KubeField::PodNamespace),
            "kube_podname" => kube(KubeField::PodName),
            "kube_containername" => kube(KubeField::ContainerName),
            "kube_containername_or_pid" => kube(KubeField::ContainerNameOrPid),
            other => bail!("unknown decoder {other:?}"),
        })
    }

    pub fn decode(&self, input: &[u8]) -> Result<Decoded> {
        let value = match self {
            Decoder::InetIp => inet_ip::decode(input)?.into_bytes(),
            Decoder::StaticMap(map) => map.decode(input).into_bytes(),
            Decoder::Regexps(rules) => match rules.decode(input) {
                Some(value) => value.into_bytes(),
                None => return Ok(Decoded::Skip),
            },
            Decoder::String => scalar::string(input),
            Decoder::Uint => scalar::uint(input)?.into_bytes(),
            Decoder::Ksym(ksyms) => ksyms.decode(input)?.into_bytes(),
            Decoder::MajorMinor => scalar::major_minor(input)?.into_bytes(),
            Decoder::Kube(kube) => match kube.decode(input)? {
                Some(value) => value.into_bytes(),
                None => return Ok(Decoded::Skip),
            },
        };
        Ok(Decoded::Value(value))
    }
}

/// One label cut out of the key at a fixed offset.
pub struct LabelDecoder {
    pub name: String,
    offset: usize,
    size: usize,
    chain: Vec<Decoder>,
}

impl LabelDecoder {
    /// Run the chain over this label's segment; None means skip the key.
    fn decode(&self, key: &[u8]) -> Result<Option<String>> {
        let mut value = key[self.offset..self.offset + self.size].to_vec();
        for decoder in &self.chain {
            match decoder
                .decode(&value)
                .with_context(|| format!("decoding label {}", self.name))?
            {
                Decoded::Value(next) => value = next,
                Decoded::Skip => return Ok(None),
            }
        }
        Ok(Some(String::from_utf8_lossy(&value).into_owned()))
    }
}

/// Splits a map key into its configured labels.
///
/// Labels are laid out in order. A `reuse` label reads its bytes without
/// advancing, so the next label starts at the same offset.
pub struct KeyDecoder {
    labels: Vec<LabelDecoder>,
    key_size: usize,
}

impl KeyDecoder {
    pub fn build(labels: &[Label], ctx: &DecoderContext) -> Result<Self> {
        let mut offset = 0;
        let mut decoders = Vec::with_capacity(labels.len());
        for label in labels {
            if label.size == 0 {
                bail!("label {} has zero size", label.name);
            }
            let chain = label
                .decoders
                .iter()
                .map(|conf| Decoder::build(conf, ctx))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("building decoders for label {}", label.name))?;
            decoders.push(LabelDecoder {
                name: label.name.clone(),
                offset,
                size: label.size,
                chain,
            });
            if !label.reuse {
                offset += label.size;
            }
        }

        let key_size = offset;
        if let Some(label) = decoders.iter().find(|l| l.offset + l.size > key_size) {
            bail!(
                "label {} reads past the {key_size}-byte key",
                label.name
            );
        }
        Ok(Self {
            labels: decoders,
            key_size,
        })
    }

    /// Total key width, the sum of all non-reuse label sizes.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    /// Label values in configured order, or None when a decoder skipped.
    pub fn decode(&self, key: &[u8]) -> Result<Option<Vec<String>>> {
        if key.len() != self.key_size {
            bail!(
                "key is {} bytes, labels expect {}",
                key.len(),
                self.key_size
            );
        }
        let mut values = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            match label.decode(key)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegexpRule;
    use crate::data::container::ContainerIdPolicy;
    use crate::data::kube_context::tests::{
        container, write_process, FakeRuntime, APP_ID, SANDBOX_ID,
    };
    use crate::data::procfs::ProcFs;
    use kube_ebpf_exporter_common::PidInfo;
    use std::collections::HashMap;
    use std::path::Path;

    fn ctx(root: &Path) -> DecoderContext {
        let runtime = Arc::new(FakeRuntime::with(vec![container(
            APP_ID, "shop", "cart-7d9f", "cart", SANDBOX_ID,
        )]));
        DecoderContext {
            identity: Arc::new(IdentityCache::new(
                ProcFs::new(root),
                runtime,
                ContainerIdPolicy::Plain,
                true,
            )),
            ksyms: Arc::new(Ksyms::new(root.join("kallsyms"))),
        }
    }

    fn decoder(name: &str) -> DecoderConfig {
        DecoderConfig {
            name: name.to_string(),
            static_map: None,
            regexps: None,
        }
    }

    fn label(name: &str, size: usize, reuse: bool, decoders: Vec<DecoderConfig>) -> Label {
        Label {
            name: name.to_string(),
            size,
            reuse,
            decoders,
        }
    }

    #[test]
    fn reused_segment_feeds_both_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 300, Some(&format!("/kubepods/pod1/{APP_ID}")), None);
        let keys = KeyDecoder::build(
            &[
                label("pod", 8, true, vec![decoder("kube_podname")]),
                label("namespace", 8, false, vec![decoder("kube_podnamespace")]),
                label("op", 4, false, vec![decoder("uint")]),
            ],
            &ctx(dir.path()),
        )
        .unwrap();
        assert_eq!(keys.key_size(), 12);
        assert_eq!(keys.label_names(), vec!["pod", "namespace", "op"]);

        let mut key = PidInfo::new(300, 1).packed().to_ne_bytes().to_vec();
        key.extend_from_slice(&2u32.to_ne_bytes());
        assert_eq!(
            keys.decode(&key).unwrap(),
            Some(vec!["cart-7d9f".into(), "shop".into(), "2".into()])
        );
    }

    #[test]
    fn chain_feeds_each_output_to_the_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapping = decoder("static_map");
        mapping.static_map = Some(HashMap::from([("1".to_string(), "read".to_string())]));
        let keys = KeyDecoder::build(
            &[label("op", 1, false, vec![decoder("uint"), mapping])],
            &ctx(dir.path()),
        )
        .unwrap();
        assert_eq!(keys.decode(&[1]).unwrap(), Some(vec!["read".into()]));
        assert_eq!(keys.decode(&[3]).unwrap(), Some(vec!["unknown:3".into()]));
    }

    #[test]
    fn regexp_miss_skips_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut rules = decoder("regexps");
        rules.regexps = Some(vec![RegexpRule::Pattern("^nginx$".into())]);
        let keys = KeyDecoder::build(
            &[label("comm", 8, false, vec![decoder("string"), rules])],
            &ctx(dir.path()),
        )
        .unwrap();
        assert_eq!(
            keys.decode(b"nginx\0\0\0").unwrap(),
            Some(vec!["nginx".into()])
        );
        assert_eq!(keys.decode(b"bash\0\0\0\0").unwrap(), None);
    }

    #[test]
    fn labels_without_decoders_keep_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyDecoder::build(&[label("raw", 3, false, vec![])], &ctx(dir.path())).unwrap();
        assert_eq!(keys.decode(b"abc").unwrap(), Some(vec!["abc".into()]));
    }

    #[test]
    fn key_width_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyDecoder::build(
            &[label("ip", 4, false, vec![decoder("inet_ip")])],
            &ctx(dir.path()),
        )
        .unwrap();
        assert!(keys.decode(&[1, 2, 3, 4, 5]).is_err());
        assert_eq!(
            keys.decode(&[127, 0, 0, 1]).unwrap(),
            Some(vec!["127.0.0.1".into()])
        );
    }

    #[test]
    fn bad_layouts_and_unknown_decoders_fail_to_build() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        // A trailing reuse label has nothing left to read.
        assert!(KeyDecoder::build(&[label("a", 4, true, vec![])], &ctx).is_err());
        assert!(KeyDecoder::build(&[label("a", 0, false, vec![])], &ctx).is_err());
        assert!(
            KeyDecoder::build(&[label("a", 4, false, vec![decoder("bogus")])], &ctx).is_err()
        );
        assert!(
            KeyDecoder::build(&[label("a", 4, false, vec![decoder("static_map")])], &ctx)
                .is_err()
        );
    }
}
