//! Attributes and methods the backend expects but source modules lack.

use infer_core::{EntityId, Result, Value};

use super::ProxySubmodule;
use crate::{BackendValue, ConversionSession, Generator, MemoryFormat};

type Provider = fn(&ProxySubmodule, &ConversionSession) -> Result<BackendValue>;

struct SyntheticAttribute {
    classes: &'static [&'static str],
    attribute: &'static str,
    provider: Provider,
}

const LINEAR: &[&str] = &["torch.nn.Linear", "torch.nn.modules.linear.Linear"];
const DROPOUT: &[&str] = &["torch.nn.Dropout", "torch.nn.modules.dropout.Dropout"];
const CONV2D: &[&str] = &["torch.nn.Conv2d", "torch.nn.modules.conv.Conv2d"];
const ATTENTION: &[&str] = &["diffusers.models.attention_processor.Attention"];

static ATTRIBUTES: &[SyntheticAttribute] = &[
    SyntheticAttribute {
        classes: LINEAR,
        attribute: "use_fused_matmul_bias",
        provider: fused_matmul_bias,
    },
    SyntheticAttribute {
        classes: DROPOUT,
        attribute: "generator",
        provider: generator,
    },
    SyntheticAttribute {
        classes: CONV2D,
        attribute: "channel_pos",
        provider: channel_pos,
    },
];

static METHODS: &[(&[&str], &[&str])] = &[(ATTENTION, &["get_attention_scores"])];

fn fused_matmul_bias(proxy: &ProxySubmodule, session: &ConversionSession) -> Result<BackendValue> {
    let has_bias = matches!(proxy.source().get("bias"), Some(Value::Tensor(_)));
    Ok(BackendValue::Bool(has_bias && session.fused_linear()))
}

fn generator(_: &ProxySubmodule, _: &ConversionSession) -> Result<BackendValue> {
    Ok(BackendValue::Generator(Generator::new()))
}

fn channel_pos(_: &ProxySubmodule, session: &ConversionSession) -> Result<BackendValue> {
    let pos = match session.memory_format() {
        MemoryFormat::ChannelsLast => "channels_last",
        MemoryFormat::ContiguousFormat => "channels_first",
    };
    Ok(BackendValue::Str(pos.to_owned()))
}

fn provider(class: &EntityId, attribute: &str) -> Option<Provider> {
    ATTRIBUTES
        .iter()
        .find(|entry| entry.attribute == attribute && entry.classes.contains(&class.as_str()))
        .map(|entry| entry.provider)
}

/// Returns `true` if `class` carries a synthetic `attribute`.
pub(crate) fn has(class: &EntityId, attribute: &str) -> bool {
    provider(class, attribute).is_some()
}

/// Computes the synthetic `attribute` of `proxy`, if it has one.
pub(crate) fn lookup(
    proxy: &ProxySubmodule,
    session: &ConversionSession,
    attribute: &str,
) -> Option<Result<BackendValue>> {
    provider(proxy.source().class_id(), attribute).map(|provider| provider(proxy, session))
}

/// Methods beyond the forward aliases that `class` dispatches.
pub(crate) fn extra_methods(class: &EntityId) -> &'static [&'static str] {
    METHODS
        .iter()
        .find(|(classes, _)| classes.contains(&class.as_str()))
        .map(|(_, methods)| *methods)
        .unwrap_or_default()
}
