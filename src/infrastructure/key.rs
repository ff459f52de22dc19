//! 服务类型键
//!
//! [`TypeKey`] 在 [`Environment`](super::Environment) 中标识一个服务类型。
//! 键由 `TypeId` 和可选的限定名组成，两者都相同时键才相等。

use std::any::TypeId;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// 有序键集合，用于声明输入与输出
pub type KeySet = BTreeSet<TypeKey>;

/// 服务类型的运行时标识
#[derive(Clone, Copy)]
pub struct TypeKey {
    type_id: TypeId,
    type_name: &'static str,
    qualifier: Option<&'static str>,
}

impl TypeKey {
    /// 服务类型 `T` 的键
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            qualifier: None,
        }
    }

    /// 同一类型的额外绑定，用名字区分
    pub fn named<T: 'static>(qualifier: &'static str) -> Self {
        Self {
            qualifier: Some(qualifier),
            ..Self::of::<T>()
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// 完整类型名（`std::any::type_name`）
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn qualifier(&self) -> Option<&'static str> {
        self.qualifier
    }

    /// 去掉模块路径的类型名，如 `app::db::DbConn` 对应 `DbConn`
    pub fn short_name(&self) -> &'static str {
        let base = self.type_name.split('<').next().unwrap_or(self.type_name);
        let start = base.rfind("::").map(|idx| idx + 2).unwrap_or(0);
        &self.type_name[start..]
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.qualifier == other.qualifier
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.qualifier.hash(state);
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // 名称优先，保证诊断输出稳定；TypeId 兜底以区分同名类型
        self.type_name
            .cmp(other.type_name)
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.type_id.cmp(&other.type_id))
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qualifier {
            Some(qualifier) => write!(f, "{}@{}", self.short_name(), qualifier),
            None => write!(f, "{}", self.short_name()),
        }
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qualifier {
            Some(qualifier) => write!(f, "TypeKey({}@{})", self.type_name, qualifier),
            None => write!(f, "TypeKey({})", self.type_name),
        }
    }
}

/// 编译期类型化的键
///
/// `Tag<T>` 只能读回 `T`，查找时只需检查是否存在。
pub struct Tag<T: 'static> {
    key: TypeKey,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: 'static> Tag<T> {
    pub fn new() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            _phantom: PhantomData,
        }
    }

    pub fn named(qualifier: &'static str) -> Self {
        Self {
            key: TypeKey::named::<T>(qualifier),
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }
}

impl<T: 'static> Default for Tag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for Tag<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for Tag<T> {}

impl<T: 'static> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag<{}>", self.key)
    }
}

impl<T: 'static> From<Tag<T>> for TypeKey {
    fn from(tag: Tag<T>) -> Self {
        tag.key
    }
}

/// 由服务类型列表构造 [`KeySet`]：`keys![AppConfig, DbConn]`
#[macro_export]
macro_rules! keys {
    () => {
        $crate::KeySet::new()
    };
    ($($ty:ty),+ $(,)?) => {{
        let mut set = $crate::KeySet::new();
        $(set.insert($crate::TypeKey::of::<$ty>());)+
        set
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DbConn;
    struct Cache;

    #[test]
    fn test_keys_of_same_type_are_equal() {
        assert_eq!(TypeKey::of::<DbConn>(), TypeKey::of::<DbConn>());
        assert_ne!(TypeKey::of::<DbConn>(), TypeKey::of::<Cache>());
    }

    #[test]
    fn test_qualified_keys_are_distinct() {
        let primary = TypeKey::of::<DbConn>();
        let replica = TypeKey::named::<DbConn>("replica");

        assert_ne!(primary, replica);
        assert_eq!(replica, TypeKey::named::<DbConn>("replica"));
        assert_eq!(replica.to_string(), "DbConn@replica");
    }

    #[test]
    fn test_short_name_strips_module_path() {
        assert_eq!(TypeKey::of::<DbConn>().short_name(), "DbConn");
        assert_eq!(TypeKey::of::<Vec<String>>().short_name(), "Vec<alloc::string::String>");
    }

    #[test]
    fn test_tag_converts_to_key() {
        let tag = Tag::<Cache>::new();
        let key: TypeKey = tag.into();
        assert_eq!(key, TypeKey::of::<Cache>());
    }

    #[test]
    fn test_keys_macro() {
        let set = crate::keys![DbConn, Cache];
        assert_eq!(set.len(), 2);
        assert!(set.contains(&TypeKey::of::<Cache>()));
    }
}
