//! 不可变的服务环境
//!
//! [`Environment`] 把 [`TypeKey`] 映射到已构建的服务实例。
//! 每次更新都返回新环境，原环境保持不变，可以直接交给并发的构建使用。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::key::{KeySet, Tag, TypeKey};
use crate::errors::LayerError;

/// 类型擦除的服务实例
pub type Instance = Arc<dyn Any + Send + Sync>;

/// 按类型索引的不可变服务容器
#[derive(Clone, Default)]
pub struct Environment {
    /// 共享存储，写时复制；实例本身始终通过 Arc 共享
    bindings: Arc<HashMap<TypeKey, Instance>>,
}

impl Environment {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 只含一个服务的环境
    pub fn single<T: Send + Sync + 'static>(value: T) -> Self {
        Self::empty().add(value)
    }

    /// 按键查找绑定
    pub fn get(&self, key: &TypeKey) -> Result<Instance, LayerError> {
        self.bindings
            .get(key)
            .cloned()
            .ok_or(LayerError::MissingService(*key))
    }

    /// 查找 `T` 的绑定
    pub fn get_service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, LayerError> {
        self.get_as::<T>(&TypeKey::of::<T>())
    }

    /// 通过类型化标签查找绑定
    pub fn get_tagged<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Result<Arc<T>, LayerError> {
        self.get_as::<T>(&tag.key())
    }

    fn get_as<T: Send + Sync + 'static>(&self, key: &TypeKey) -> Result<Arc<T>, LayerError> {
        self.get(key)?
            .downcast::<T>()
            .map_err(|_| LayerError::TypeMismatch {
                key: *key,
                expected: std::any::type_name::<T>(),
            })
    }

    /// 返回新环境，`value` 绑定在 `TypeKey::of::<T>()` 下
    pub fn add<T: Send + Sync + 'static>(&self, value: T) -> Self {
        self.add_instance(TypeKey::of::<T>(), Arc::new(value))
    }

    /// 返回新环境，`value` 绑定在标签的键下
    pub fn add_tagged<T: Send + Sync + 'static>(&self, tag: &Tag<T>, value: T) -> Self {
        self.add_instance(tag.key(), Arc::new(value))
    }

    /// 返回新环境，已共享的实例绑定在 `key` 下
    pub fn add_instance(&self, key: TypeKey, instance: Instance) -> Self {
        let mut next = self.clone();
        next.insert(key, instance);
        next
    }

    /// 原地插入，仅在构建方独占环境时使用
    pub fn insert(&mut self, key: TypeKey, instance: Instance) {
        Arc::make_mut(&mut self.bindings).insert(key, instance);
    }

    /// 合并两个环境，键冲突时以 `other` 为准
    pub fn union(&self, other: &Environment) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut merged = self.clone();
        let map = Arc::make_mut(&mut merged.bindings);
        for (key, instance) in other.bindings.iter() {
            map.insert(*key, instance.clone());
        }
        merged
    }

    /// 只保留 `keys` 中的绑定
    pub fn restrict(&self, keys: &KeySet) -> Self {
        if self.bindings.len() == keys.len() && keys.iter().all(|key| self.contains(key)) {
            return self.clone();
        }
        let bindings = keys
            .iter()
            .filter_map(|key| self.bindings.get(key).map(|instance| (*key, instance.clone())))
            .collect();
        Self {
            bindings: Arc::new(bindings),
        }
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        self.bindings.contains_key(key)
    }

    pub fn keys(&self) -> KeySet {
        self.bindings.keys().copied().collect()
    }

    /// `keys` 中尚未绑定的键
    pub fn missing<'a>(&self, keys: impl IntoIterator<Item = &'a TypeKey>) -> Vec<TypeKey> {
        keys.into_iter()
            .filter(|key| !self.contains(key))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct AppConfig {
        port: u16,
    }

    #[derive(Debug)]
    struct DbConn;

    #[test]
    fn test_add_then_get() {
        let env = Environment::empty().add(AppConfig { port: 8080 });
        let config = env.get_service::<AppConfig>().unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_add_does_not_mutate_original() {
        let base = Environment::empty().add(AppConfig { port: 1 });
        let extended = base.add(DbConn);

        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert!(!base.contains(&TypeKey::of::<DbConn>()));
    }

    #[test]
    fn test_add_overwrites_existing_binding() {
        let env = Environment::empty()
            .add(AppConfig { port: 1 })
            .add(AppConfig { port: 2 });
        assert_eq!(env.len(), 1);
        assert_eq!(env.get_service::<AppConfig>().unwrap().port, 2);
    }

    #[test]
    fn test_union_is_right_biased() {
        let left = Environment::empty().add(AppConfig { port: 1 }).add(DbConn);
        let right = Environment::empty().add(AppConfig { port: 2 });

        let merged = left.union(&right);
        assert_eq!(merged.get_service::<AppConfig>().unwrap().port, 2);
        assert!(merged.contains(&TypeKey::of::<DbConn>()));
        assert_eq!(left.get_service::<AppConfig>().unwrap().port, 1);
    }

    #[test]
    fn test_missing_service() {
        let env = Environment::empty();
        let result = env.get_service::<DbConn>();
        assert!(matches!(
            result,
            Err(LayerError::MissingService(key)) if key == TypeKey::of::<DbConn>()
        ));
    }

    #[test]
    fn test_restrict_keeps_only_requested_keys() {
        let env = Environment::empty().add(AppConfig { port: 1 }).add(DbConn);
        let narrowed = env.restrict(&crate::keys![DbConn]);

        assert_eq!(narrowed.keys(), crate::keys![DbConn]);
        assert!(narrowed.get_service::<AppConfig>().is_err());
    }

    #[test]
    fn test_tagged_bindings_coexist() {
        let primary = Tag::<AppConfig>::new();
        let replica = Tag::<AppConfig>::named("replica");
        let env = Environment::empty()
            .add_tagged(&primary, AppConfig { port: 5432 })
            .add_tagged(&replica, AppConfig { port: 5433 });

        assert_eq!(env.get_tagged(&primary).unwrap().port, 5432);
        assert_eq!(env.get_tagged(&replica).unwrap().port, 5433);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let key = TypeKey::of::<AppConfig>();
        let env = Environment::empty().add_instance(key, Arc::new(DbConn));
        assert!(matches!(env.get_service::<AppConfig>(), Err(LayerError::TypeMismatch { .. })));
    }

    #[test]
    fn test_instances_are_shared_between_environments() {
        let base = Environment::empty().add(AppConfig { port: 1 });
        let extended = base.add(DbConn);

        let a = base.get_service::<AppConfig>().unwrap();
        let b = extended.get_service::<AppConfig>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
