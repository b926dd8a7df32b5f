//! Reference backend classes.
//!
//! Just enough of a layer library to run the dispatch machinery end to end:
//! dense `float32` kernels on host memory, no autograd.

use std::sync::Arc;

use infer_core::{CallArgs, EntityId, Error, Result};

use crate::proxy::ModuleProxy;
use crate::registry::EntityRegistry;
use crate::{BackendClass, BackendTensor, BackendValue, TRACING_TARGET_PROXY, backend_function};

fn input(args: &CallArgs<BackendValue>) -> Result<&BackendValue> {
    args.get(0, "input")
        .ok_or_else(|| Error::InvalidArgument("missing argument 'input'".into()))
}

fn map_f32(tensor: &BackendTensor, f: impl Fn(f32) -> f32) -> Result<BackendTensor> {
    let values: Vec<f32> = tensor.to_f32_vec()?.into_iter().map(f).collect();
    Ok(BackendTensor::from_f32(tensor.shape().to_vec(), &values)?.with_device(tensor.device()))
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// `y = x Wᵀ + b`.
#[derive(Debug)]
pub struct Linear {
    entity: EntityId,
}

impl Linear {
    /// A linear layer bound to `oneflow.nn.Linear`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.Linear".into(),
        }
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for Linear {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, this: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        let x = input(&args)?.expect_tensor("input")?;
        let weight = this.get_parameter("weight")?;
        let bias = if this.has_attribute("bias") {
            match this.attribute("bias")? {
                BackendValue::Tensor(bias) => Some(bias),
                BackendValue::None => None,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "bias must be a tensor or None, got {}",
                        other.kind_name()
                    )));
                }
            }
        } else {
            None
        };
        if let Ok(BackendValue::Bool(fused)) = this.attribute("use_fused_matmul_bias") {
            tracing::trace!(target: TRACING_TARGET_PROXY, path = %this.path(), fused, "linear");
        }

        let [out_features, in_features] = *weight.shape() else {
            return Err(Error::InvalidArgument(format!(
                "linear weight must be 2-d, got shape {:?}",
                weight.shape()
            )));
        };
        if x.shape().last() != Some(&in_features) {
            return Err(Error::InvalidArgument(format!(
                "input shape {:?} does not end in {in_features}",
                x.shape()
            )));
        }

        if let Some(bias) = &bias
            && bias.shape() != [out_features]
        {
            return Err(Error::InvalidArgument(format!(
                "linear bias must have shape [{out_features}], got {:?}",
                bias.shape()
            )));
        }

        let xs = x.to_f32_vec()?;
        let ws = weight.to_f32_vec()?;
        let bs = bias.map(|b| b.to_f32_vec()).transpose()?;
        let rows = xs.len() / in_features.max(1);
        let mut out = Vec::with_capacity(rows * out_features);
        for row in xs.chunks(in_features.max(1)).take(rows) {
            for (o, w) in ws.chunks(in_features.max(1)).enumerate() {
                let dot: f32 = row.iter().zip(w).map(|(a, b)| a * b).sum();
                out.push(dot + bs.as_ref().map_or(0.0, |b| b[o]));
            }
        }

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = out_features;
        }
        Ok(BackendTensor::from_f32(shape, &out)?
            .with_device(x.device())
            .into())
    }
}

/// Runs its items in order, feeding each output to the next item.
#[derive(Debug)]
pub struct Sequential {
    entity: EntityId,
}

impl Sequential {
    /// A sequential container bound to `oneflow.nn.Sequential`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.Sequential".into(),
        }
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for Sequential {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, this: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        let mut x = input(&args)?.clone();
        for index in 0..this.len() {
            x = match this.index(index as isize)? {
                BackendValue::Module(module) => module.invoke(CallArgs::positional([x]))?,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "item {index} of '{}' is a {}, not a module",
                        this.path(),
                        other.kind_name()
                    )));
                }
            };
        }
        Ok(x)
    }
}

/// Holds submodules; not callable.
#[derive(Debug)]
pub struct ModuleList {
    entity: EntityId,
}

impl ModuleList {
    /// A module list bound to `oneflow.nn.ModuleList`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.ModuleList".into(),
        }
    }
}

impl Default for ModuleList {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for ModuleList {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, this: &dyn ModuleProxy, _: CallArgs<BackendValue>) -> Result<BackendValue> {
        Err(Error::InvalidArgument(format!(
            "module list '{}' has no forward",
            this.path()
        )))
    }
}

/// Returns its input.
#[derive(Debug)]
pub struct Identity {
    entity: EntityId,
}

impl Identity {
    /// An identity bound to `oneflow.nn.Identity`.
    pub fn new() -> Self {
        Self::with_entity("oneflow.nn.Identity")
    }

    /// An identity class registered under a custom backend identifier.
    pub fn with_entity(entity: impl Into<EntityId>) -> Self {
        Self {
            entity: entity.into(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for Identity {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, _: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        input(&args).cloned()
    }
}

/// Rectified linear unit.
#[derive(Debug)]
pub struct ReLU {
    entity: EntityId,
}

impl ReLU {
    /// A ReLU bound to `oneflow.nn.ReLU`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.ReLU".into(),
        }
    }
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for ReLU {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, _: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        let x = input(&args)?.expect_tensor("input")?;
        Ok(map_f32(x, relu)?.into())
    }
}

/// Sigmoid linear unit.
#[derive(Debug)]
pub struct SiLU {
    entity: EntityId,
}

impl SiLU {
    /// A SiLU bound to `oneflow.nn.SiLU`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.SiLU".into(),
        }
    }
}

impl Default for SiLU {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for SiLU {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, _: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        let x = input(&args)?.expect_tensor("input")?;
        Ok(map_f32(x, silu)?.into())
    }
}

/// Dropout. Inference only, so the input passes through.
#[derive(Debug)]
pub struct Dropout {
    entity: EntityId,
}

impl Dropout {
    /// A dropout layer bound to `oneflow.nn.Dropout`.
    pub fn new() -> Self {
        Self {
            entity: "oneflow.nn.Dropout".into(),
        }
    }
}

impl Default for Dropout {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClass for Dropout {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn forward(&self, this: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        if let BackendValue::Generator(generator) = this.attribute("generator")? {
            tracing::trace!(
                target: TRACING_TARGET_PROXY,
                path = %this.path(),
                seed = generator.seed(),
                "dropout skipped in inference"
            );
        }
        input(&args).cloned()
    }
}

/// Populates `registry` with the reference catalog and the `torch` to
/// `oneflow` namespace rule.
pub fn register(registry: &mut EntityRegistry) {
    let classes: [(Arc<dyn BackendClass>, &str); 7] = [
        (Arc::new(Linear::new()), "torch.nn.modules.linear.Linear"),
        (Arc::new(Sequential::new()), "torch.nn.modules.container.Sequential"),
        (Arc::new(ModuleList::new()), "torch.nn.modules.container.ModuleList"),
        (Arc::new(Identity::new()), "torch.nn.modules.linear.Identity"),
        (Arc::new(ReLU::new()), "torch.nn.modules.activation.ReLU"),
        (Arc::new(SiLU::new()), "torch.nn.modules.activation.SiLU"),
        (Arc::new(Dropout::new()), "torch.nn.modules.dropout.Dropout"),
    ];
    for (class, qualified) in classes {
        registry.register_override(qualified.into(), Arc::clone(&class));
        registry.register_class(class);
    }

    registry.register_function(
        "oneflow.relu",
        backend_function(|args| {
            let x = input(&args)?.expect_tensor("input")?;
            Ok(map_f32(x, relu)?.into())
        }),
    );
    registry.register_function(
        "oneflow.nn.functional.silu",
        backend_function(|args| {
            let x = input(&args)?.expect_tensor("input")?;
            Ok(map_f32(x, silu)?.into())
        }),
    );

    registry.register([("torch", "oneflow")], []);
}
