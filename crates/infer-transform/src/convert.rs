//! Object graph conversion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use infer_core::{EntityId, Error, Module, ObjectKey, Opaque, Result, Tensor, Value};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::proxy::{ModuleProxy, ProxySubmodule, join_path};
use crate::{
    BackendDType, BackendDevice, BackendTensor, BackendValue, TRACING_TARGET_CONVERT,
    TransformManager,
};

/// Memory layout requested for convolution inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemoryFormat {
    #[default]
    #[strum(to_string = "contiguous_format", serialize = "contiguous")]
    ContiguousFormat,
    ChannelsLast,
}

/// Per-session overrides of the manager settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Memory layout reported to convolution layers.
    pub memory_format: MemoryFormat,
    /// Overrides [`Settings::fused_linear`](crate::Settings::fused_linear).
    pub fused_linear: Option<bool>,
    /// Overrides [`Settings::strict`](crate::Settings::strict).
    pub strict: Option<bool>,
}

/// Where a value being converted was read from. Only used to key warnings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Origin<'a> {
    pub attribute: &'a str,
    pub owner: &'a EntityId,
}

#[derive(Default)]
struct SessionCache {
    /// Source identity to (source, converted).
    forward: HashMap<ObjectKey, (Value, BackendValue)>,
    /// Converted identity to source.
    reverse: HashMap<ObjectKey, Value>,
    /// Proxies in creation order.
    realized: Vec<Arc<ProxySubmodule>>,
}

/// Conversion state for one model.
///
/// Every source object is converted at most once per session; converting
/// it again returns the identical backend value. Sessions never share
/// caches, so converting two models cannot interfere.
pub struct ConversionSession {
    id: Uuid,
    manager: Arc<TransformManager>,
    memory_format: MemoryFormat,
    fused_linear: bool,
    strict: bool,
    this: Weak<ConversionSession>,
    cache: Mutex<SessionCache>,
}

impl ConversionSession {
    /// Opens a session that follows the manager settings.
    pub fn new(manager: Arc<TransformManager>, memory_format: MemoryFormat) -> Arc<Self> {
        Self::with_options(
            manager,
            SessionOptions {
                memory_format,
                ..SessionOptions::default()
            },
        )
    }

    /// Opens a session with per-session overrides.
    pub fn with_options(manager: Arc<TransformManager>, options: SessionOptions) -> Arc<Self> {
        let settings = manager.settings();
        let fused_linear = options.fused_linear.unwrap_or(settings.fused_linear);
        let strict = options.strict.unwrap_or(settings.strict);
        let session = Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            manager,
            memory_format: options.memory_format,
            fused_linear,
            strict,
            this: this.clone(),
            cache: Mutex::new(SessionCache::default()),
        });
        tracing::debug!(
            target: TRACING_TARGET_CONVERT,
            session = %session.id,
            memory_format = %session.memory_format,
            fused_linear,
            strict,
            "opened conversion session"
        );
        session
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Manager the session resolves through.
    pub fn manager(&self) -> &Arc<TransformManager> {
        &self.manager
    }

    /// Requested memory format.
    pub fn memory_format(&self) -> MemoryFormat {
        self.memory_format
    }

    /// Whether linear layers with a bias report the fused path.
    pub fn fused_linear(&self) -> bool {
        self.fused_linear
    }

    /// Whether conversion is strict.
    pub fn strict(&self) -> bool {
        self.strict
    }

    fn cache(&self) -> MutexGuard<'_, SessionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Converts a source value to its backend counterpart.
    ///
    /// # Errors
    ///
    /// Fails on dtypes and devices without a backend equivalent, and, in
    /// strict mode, on module classes that do not resolve and on values of
    /// unregistered types.
    pub fn convert(&self, value: &Value) -> Result<BackendValue> {
        self.convert_at(value, "", None)
    }

    /// Converts a module into the root proxy of the session.
    ///
    /// # Errors
    ///
    /// See [`ConversionSession::convert`].
    pub fn convert_module(&self, module: &Arc<Module>) -> Result<Arc<ProxySubmodule>> {
        self.proxy_for(module, "")
    }

    pub(crate) fn convert_at(
        &self,
        value: &Value,
        path: &str,
        origin: Option<Origin<'_>>,
    ) -> Result<BackendValue> {
        match value {
            Value::None => Ok(BackendValue::None),
            Value::Bool(v) => Ok(BackendValue::Bool(*v)),
            Value::Int(v) => Ok(BackendValue::Int(*v)),
            Value::Float(v) => Ok(BackendValue::Float(*v)),
            Value::Str(v) => Ok(BackendValue::Str(v.clone())),
            Value::DType(dtype) => BackendDType::from_source(*dtype).map(BackendValue::DType),
            Value::Device(device) => BackendDevice::from_source(*device).map(BackendValue::Device),
            Value::Tensor(tensor) => self.convert_tensor(tensor).map(BackendValue::Tensor),
            Value::Module(module) => self.proxy_for(module, path).map(BackendValue::Module),
            Value::List(items) => self.convert_items(items, path, origin).map(BackendValue::List),
            Value::Tuple(items) => self.convert_items(items, path, origin).map(BackendValue::Tuple),
            Value::Opaque(opaque) => self.convert_opaque(opaque, origin),
        }
    }

    fn convert_items(
        &self,
        items: &[Value],
        path: &str,
        origin: Option<Origin<'_>>,
    ) -> Result<Vec<BackendValue>> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| self.convert_at(item, &join_path(path, &index.to_string()), origin))
            .collect()
    }

    /// Converts a tensor, sharing its storage.
    ///
    /// # Errors
    ///
    /// Fails when the dtype or device has no backend equivalent.
    pub fn convert_tensor(&self, tensor: &Arc<Tensor>) -> Result<Arc<BackendTensor>> {
        let key = ObjectKey::of(tensor);
        if let Some((_, BackendValue::Tensor(converted))) = self.cache().forward.get(&key) {
            return Ok(Arc::clone(converted));
        }

        let converted = Arc::new(BackendTensor::from_source(tensor)?);
        let mut cache = self.cache();
        // Another thread may have converted the same tensor meanwhile.
        if let Some((_, BackendValue::Tensor(existing))) = cache.forward.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let source = Value::Tensor(Arc::clone(tensor));
        cache
            .reverse
            .insert(ObjectKey::of(&converted), source.clone());
        cache
            .forward
            .insert(key, (source, BackendValue::Tensor(Arc::clone(&converted))));
        Ok(converted)
    }

    fn proxy_for(&self, module: &Arc<Module>, path: &str) -> Result<Arc<ProxySubmodule>> {
        let key = ObjectKey::of(module);
        let mut cache = self.cache();
        if let Some((_, BackendValue::Module(proxy))) = cache.forward.get(&key) {
            return Ok(Arc::clone(proxy));
        }

        let proxy = Arc::new(ProxySubmodule::new(
            Arc::clone(module),
            path.to_owned(),
            self.this.clone(),
        ));
        if self.strict {
            proxy.backend_class_with(&self.manager)?;
        }

        let source = Value::Module(Arc::clone(module));
        cache.reverse.insert(ObjectKey::of(&proxy), source.clone());
        cache
            .forward
            .insert(key, (source, BackendValue::Module(Arc::clone(&proxy))));
        cache.realized.push(Arc::clone(&proxy));
        if self.manager.settings().debug {
            tracing::debug!(
                target: TRACING_TARGET_CONVERT,
                session = %self.id,
                path = %path,
                class = %module.class_id(),
                "created proxy"
            );
        }
        Ok(proxy)
    }

    fn convert_opaque(&self, opaque: &Arc<Opaque>, origin: Option<Origin<'_>>) -> Result<BackendValue> {
        let type_id = opaque.class_id();
        if !self.manager.is_passthrough(type_id) {
            if self.strict {
                return Err(Error::UnregisteredType {
                    type_id: type_id.clone(),
                    attribute: origin.map(|o| o.attribute.to_owned()),
                });
            }
            let (key, message) = match origin {
                Some(origin) => (
                    format!("attribute:{}:{type_id}", origin.attribute),
                    format!(
                        "attribute '{}' of '{}' has unregistered type '{type_id}'; passing it through unchanged",
                        origin.attribute, origin.owner
                    ),
                ),
                None => (
                    format!("type:{type_id}"),
                    format!("unregistered type '{type_id}'; passing it through unchanged"),
                ),
            };
            self.manager.warn_once(key, message);
        }
        Ok(BackendValue::Opaque(Arc::clone(opaque)))
    }

    /// Maps a backend value back onto the source framework.
    ///
    /// Values that came out of this session map back to the original source
    /// object; new tensors become source tensors sharing their storage.
    ///
    /// # Errors
    ///
    /// Fails if a new tensor's storage does not match its shape.
    pub fn reverse(&self, value: &BackendValue) -> Result<Value> {
        if let Some(key) = value.object_key()
            && let Some(source) = self.cache().reverse.get(&key)
        {
            return Ok(source.clone());
        }

        Ok(match value {
            BackendValue::None => Value::None,
            BackendValue::Bool(v) => Value::Bool(*v),
            BackendValue::Int(v) => Value::Int(*v),
            BackendValue::Float(v) => Value::Float(*v),
            BackendValue::Str(v) => Value::Str(v.clone()),
            BackendValue::DType(dtype) => Value::DType(dtype.to_source()),
            BackendValue::Device(device) => Value::Device(device.to_source()),
            BackendValue::Tensor(tensor) => Value::tensor(tensor.to_source()?),
            BackendValue::Module(proxy) => Value::Module(Arc::clone(proxy.source())),
            BackendValue::List(items) => Value::List(self.reverse_items(items)?),
            BackendValue::Tuple(items) => Value::Tuple(self.reverse_items(items)?),
            BackendValue::Opaque(opaque) => Value::Opaque(Arc::clone(opaque)),
            BackendValue::Generator(generator) => Value::opaque(
                Opaque::new("torch.Generator", generator.seed())
                    .with_repr(format!("Generator(seed={})", generator.seed())),
            ),
        })
    }

    fn reverse_items(&self, items: &[BackendValue]) -> Result<Vec<Value>> {
        items.iter().map(|item| self.reverse(item)).collect()
    }

    /// Every proxy created so far, in creation order.
    pub fn proxies(&self) -> Vec<Arc<ProxySubmodule>> {
        self.cache().realized.clone()
    }

    /// `(path, source class)` of every proxy created so far, in creation
    /// order.
    pub fn realized(&self) -> Vec<(String, EntityId)> {
        self.cache()
            .realized
            .iter()
            .map(|proxy| (proxy.path().to_owned(), proxy.class_id().clone()))
            .collect()
    }

    /// Number of cached conversions.
    pub fn len(&self) -> usize {
        self.cache().forward.len()
    }

    /// Returns `true` if nothing has been converted yet.
    pub fn is_empty(&self) -> bool {
        self.cache().forward.is_empty()
    }
}

impl std::fmt::Debug for ConversionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionSession")
            .field("id", &self.id)
            .field("memory_format", &self.memory_format)
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use infer_core::{DType, Device};

    use super::*;
    use crate::Settings;

    fn session_with(settings: Settings) -> Arc<ConversionSession> {
        let manager = TransformManager::with_builtins(settings).shared();
        ConversionSession::new(manager, MemoryFormat::default())
    }

    fn session() -> Arc<ConversionSession> {
        session_with(Settings::default())
    }

    #[test]
    fn test_session_options_override_settings() {
        let manager = TransformManager::with_builtins(Settings::default().with_strict(true)).shared();
        let session = ConversionSession::with_options(
            manager,
            SessionOptions {
                strict: Some(false),
                fused_linear: Some(true),
                ..SessionOptions::default()
            },
        );
        assert!(!session.strict());
        assert!(session.fused_linear());
        assert!(session.convert(&Value::module(Module::new("acme.Block"))).is_ok());
    }

    #[test]
    fn test_identity_is_preserved() {
        let session = session();
        let tensor = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap().shared();
        let a = session.convert(&Value::Tensor(Arc::clone(&tensor))).unwrap();
        let b = session.convert(&Value::Tensor(Arc::clone(&tensor))).unwrap();
        assert_eq!(a.object_key(), b.object_key());
        assert_eq!(session.len(), 1);

        let module = Module::new("torch.nn.ReLU").shared();
        let a = session.convert(&Value::Module(Arc::clone(&module))).unwrap();
        let b = session.convert(&Value::Module(Arc::clone(&module))).unwrap();
        assert_eq!(a.object_key(), b.object_key());
    }

    #[test]
    fn test_sessions_do_not_share_caches() {
        let tensor = Tensor::from_f32(vec![1], &[1.0]).unwrap().shared();
        let a = session().convert(&Value::Tensor(Arc::clone(&tensor))).unwrap();
        let b = session().convert(&Value::Tensor(Arc::clone(&tensor))).unwrap();
        assert_ne!(a.object_key(), b.object_key());
    }

    #[test]
    fn test_containers_keep_order() {
        let session = session();
        let value = Value::Tuple(vec![
            Value::Int(1),
            Value::List(vec![Value::Str("a".into()), Value::Bool(true)]),
            Value::DType(DType::Float16),
            Value::Device(Device::cuda(0)),
        ]);
        let BackendValue::Tuple(items) = session.convert(&value).unwrap() else {
            panic!("expected a tuple");
        };
        assert!(matches!(items[0], BackendValue::Int(1)));
        assert!(matches!(&items[1], BackendValue::List(inner) if inner.len() == 2));
        assert!(matches!(items[2], BackendValue::DType(BackendDType::Float16)));
        assert!(matches!(items[3], BackendValue::Device(BackendDevice::Cuda(0))));
    }

    #[test]
    fn test_unsupported_enumerants_fail() {
        let session = session();
        assert!(matches!(
            session.convert(&Value::DType(DType::Complex128)),
            Err(Error::UnsupportedDType(_))
        ));
        let meta: Device = "meta".parse().unwrap();
        assert!(matches!(
            session.convert(&Value::Device(meta)),
            Err(Error::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn test_tensors_are_zero_copy_without_grad() {
        let session = session();
        let param = Tensor::from_f32(vec![2], &[3.0, 4.0])
            .unwrap()
            .into_parameter()
            .shared();
        let converted = session.convert_tensor(&param).unwrap();
        assert_eq!(converted.storage().as_ptr(), param.storage().as_ptr());
        assert!(!converted.requires_grad());
    }

    #[test]
    fn test_opaque_values_warn_once_per_type() {
        let session = session();
        let timer = Value::opaque(Opaque::new("my_pkg.Timer", ()));
        let other_timer = Value::opaque(Opaque::new("my_pkg.Timer", ()));
        let converted = session.convert(&timer).unwrap();
        assert!(matches!(converted, BackendValue::Opaque(_)));
        session.convert(&other_timer).unwrap();
        let warnings = session.manager().warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("my_pkg.Timer"));
    }

    #[test]
    fn test_passthrough_types_do_not_warn() {
        let session = session();
        session
            .manager()
            .registry_mut()
            .register_passthrough("my_pkg.Scheduler");
        session
            .convert(&Value::opaque(Opaque::new("my_pkg.Scheduler", ())))
            .unwrap();
        assert!(session.manager().warnings().is_empty());
    }

    #[test]
    fn test_strict_mode_rejects_unregistered_types() {
        let session = session_with(Settings::default().with_strict(true));
        let err = session
            .convert(&Value::opaque(Opaque::new("my_pkg.Timer", ())))
            .unwrap_err();
        assert!(matches!(err, Error::UnregisteredType { .. }));

        let err = session
            .convert(&Value::module(Module::new("acme.Block")))
            .unwrap_err();
        assert!(matches!(err, Error::NoBackendEquivalent(_)));
    }

    #[test]
    fn test_reverse_maps_back_to_source_objects() {
        let session = session();
        let tensor = Tensor::from_f32(vec![1], &[5.0]).unwrap().shared();
        let module = Module::new("torch.nn.Identity").shared();
        let converted = session
            .convert(&Value::List(vec![
                Value::Tensor(Arc::clone(&tensor)),
                Value::Module(Arc::clone(&module)),
            ]))
            .unwrap();
        let Value::List(items) = session.reverse(&converted).unwrap() else {
            panic!("expected a list");
        };
        assert!(items[0].same_as(&Value::Tensor(tensor)));
        assert!(items[1].same_as(&Value::Module(module)));

        let fresh = BackendValue::tensor(BackendTensor::from_f32(vec![1], &[9.0]).unwrap());
        let Value::Tensor(back) = session.reverse(&fresh).unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(back.storage().as_ptr(), fresh.as_tensor().unwrap().storage().as_ptr());
    }

    #[test]
    fn test_cyclic_graphs_terminate() {
        let session = session();
        let parent = Module::new("my.Parent").shared();
        let child = Module::new("my.Child").shared();
        child.set("parent", Arc::clone(&parent));
        parent.set("child", Arc::clone(&child));

        let root = session.convert_module(&parent).unwrap();
        let child_proxy = root.get_child("child").unwrap();
        let back = child_proxy.as_module().unwrap().get_child("parent").unwrap();
        assert_eq!(back.object_key(), Some(ObjectKey::of(&root)));
        assert_eq!(
            session.realized(),
            vec![
                (String::new(), EntityId::from("my.Parent")),
                ("child".to_owned(), EntityId::from("my.Child")),
            ]
        );
    }

    #[test]
    fn test_memory_format_names() {
        assert_eq!(MemoryFormat::ChannelsLast.to_string(), "channels_last");
        assert_eq!(
            "contiguous".parse::<MemoryFormat>().unwrap(),
            MemoryFormat::ContiguousFormat
        );
    }
}
