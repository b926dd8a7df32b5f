//! Input signatures keying compiled graphs.

use std::collections::BTreeMap;
use std::fmt;

use infer_core::{CallArgs, DType, EntityId, Value};
use serde::{Deserialize, Serialize};

/// Shape-level description of one call argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgSignature {
    None,
    Scalar {
        type_name: String,
    },
    Tensor {
        dtype: DType,
        rank: usize,
        /// `None` when compiled with dynamic shapes.
        shape: Option<Vec<usize>>,
    },
    Module {
        class: EntityId,
    },
    Sequence {
        tuple: bool,
        items: Vec<ArgSignature>,
    },
    Other {
        class: EntityId,
    },
}

impl ArgSignature {
    /// Describes `value`.
    pub fn of(value: &Value, dynamic: bool) -> Self {
        match value {
            Value::None => Self::None,
            Value::Bool(_) => Self::scalar("bool"),
            Value::Int(_) => Self::scalar("int"),
            Value::Float(_) => Self::scalar("float"),
            Value::Str(_) => Self::scalar("str"),
            Value::DType(_) => Self::scalar("dtype"),
            Value::Device(_) => Self::scalar("device"),
            Value::Tensor(tensor) => Self::Tensor {
                dtype: tensor.dtype(),
                rank: tensor.shape().len(),
                shape: (!dynamic).then(|| tensor.shape().to_vec()),
            },
            Value::Module(module) => Self::Module {
                class: module.class_id().clone(),
            },
            Value::List(items) => Self::sequence(false, items, dynamic),
            Value::Tuple(items) => Self::sequence(true, items, dynamic),
            Value::Opaque(opaque) => Self::Other {
                class: opaque.class_id().clone(),
            },
        }
    }

    fn scalar(type_name: &str) -> Self {
        Self::Scalar {
            type_name: type_name.to_owned(),
        }
    }

    fn sequence(tuple: bool, items: &[Value], dynamic: bool) -> Self {
        Self::Sequence {
            tuple,
            items: items.iter().map(|item| Self::of(item, dynamic)).collect(),
        }
    }
}

impl fmt::Display for ArgSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Scalar { type_name } => f.write_str(type_name),
            Self::Tensor {
                dtype,
                shape: Some(shape),
                ..
            } => write!(f, "{dtype}{shape:?}"),
            Self::Tensor {
                dtype,
                rank,
                shape: None,
            } => write!(f, "{dtype}[rank {rank}]"),
            Self::Module { class } | Self::Other { class } => write!(f, "{class}"),
            Self::Sequence { tuple, items } => {
                let (open, close) = if *tuple { ('(', ')') } else { ('[', ']') };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

/// Signature of a whole call. Calls with equal signatures share a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSignature {
    pub positional: Vec<ArgSignature>,
    pub keyword: BTreeMap<String, ArgSignature>,
}

impl InputSignature {
    /// Describes `args`. With `dynamic`, tensor shapes are reduced to ranks.
    pub fn of(args: &CallArgs<Value>, dynamic: bool) -> Self {
        Self {
            positional: args
                .positional
                .iter()
                .map(|value| ArgSignature::of(value, dynamic))
                .collect(),
            keyword: args
                .keyword
                .iter()
                .map(|(name, value)| (name.clone(), ArgSignature::of(value, dynamic)))
                .collect(),
        }
    }
}

impl fmt::Display for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        let mut first = true;
        for arg in &self.positional {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{arg}")?;
        }
        for (name, arg) in &self.keyword {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}={arg}")?;
        }
        f.write_str(")")
    }
}
